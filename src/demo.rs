//! Canned programs run by the binary when it is given no file.

use crate::lang::{
    node::{BinOp, Node, Param},
    program::Program,
    value::VBType,
};

pub struct Demo {
    pub title: &'static str,
    pub program: Program,
}

pub fn all() -> Vec<Demo> {
    vec![
        Demo {
            title: "hello",
            program: Program::new(vec![
                Node::declare("who", None, Node::string("world")),
                print(Node::string("hello")),
                print(Node::var("who")),
            ]),
        },
        Demo {
            title: "repeat",
            program: Program::new(vec![
                Node::declare("count", None, Node::number(0.0)),
                Node::Repeat {
                    times: Box::new(Node::number(3.0)),
                    body: vec![
                        Node::assign(
                            "count",
                            Node::binary(Node::var("count"), BinOp::Add, Node::number(1.0)),
                        ),
                        print(Node::convert(Node::var("count"), VBType::String)),
                    ],
                },
            ]),
        },
        Demo {
            title: "lists",
            program: Program::new(vec![
                Node::declare(
                    "fruit",
                    None,
                    Node::List(vec![
                        Node::string("apple"),
                        Node::string("pear"),
                        Node::string("plum"),
                    ]),
                ),
                Node::ListSet {
                    index: Box::new(Node::number(2.0)),
                    list: Box::new(Node::var("fruit")),
                    value: Box::new(Node::string("fig")),
                },
                print(Node::ListGet {
                    index: Box::new(Node::number(2.0)),
                    list: Box::new(Node::var("fruit")),
                }),
            ]),
        },
        Demo {
            title: "factorial",
            program: Program::new(vec![
                factorial(),
                print(Node::convert(
                    Node::call("fact", vec![Node::number(10.0)]),
                    VBType::String,
                )),
            ]),
        },
    ]
}

fn print(node: Node) -> Node {
    Node::call("print", vec![node])
}

fn factorial() -> Node {
    let n = || Node::var("n");
    Node::ProcDef {
        name: "fact".to_string(),
        params: vec![Param::untyped("n")],
        return_type: Some(VBType::Number),
        body: vec![
            Node::If {
                condition: Box::new(Node::binary(n(), BinOp::LessEqual, Node::number(1.0))),
                then: vec![Node::ret(Some(Node::number(1.0)))],
                otherwise: None,
            },
            Node::ret(Some(Node::binary(
                n(),
                BinOp::Mul,
                Node::call(
                    "fact",
                    vec![Node::binary(n(), BinOp::Sub, Node::number(1.0))],
                ),
            ))),
        ],
    }
}
