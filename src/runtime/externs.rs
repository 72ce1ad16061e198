use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::lang::value::{VBType, Value};

/// Parameter and return types of a callable procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<VBType>,
    pub ret: VBType,
}

impl Signature {
    pub fn new(params: Vec<VBType>, ret: VBType) -> Self {
        Signature { params, ret }
    }
}

/// Failure reported by a host procedure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExternError(pub String);

impl ExternError {
    pub fn new(msg: impl Into<String>) -> Self {
        ExternError(msg.into())
    }
}

pub type ExternResult = Result<Option<Value>, ExternError>;

type ExternFn = Box<dyn FnMut(&[Value]) -> ExternResult>;

struct Extern {
    signature: Signature,
    implementation: ExternFn,
}

/// Host procedures callable from VeryBasic through `CallExtern`.
///
/// Implementations receive their arguments in declaration order and return
/// `Some(value)` unless the signature's return type is Void.
#[derive(Default)]
pub struct ExternTable {
    entries: HashMap<String, Extern>,
}

impl ExternTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host procedures available by default: `print` and `ask`, wired
    /// to stdout and stdin.
    pub fn standard() -> Self {
        Self::standard_with(io::stdout(), io::BufReader::new(io::stdin()))
    }

    /// `print` and `ask` over arbitrary streams.
    pub fn standard_with<W, R>(output: W, input: R) -> Self
    where
        W: Write + 'static,
        R: BufRead + 'static,
    {
        let output = Rc::new(RefCell::new(output));
        let mut table = ExternTable::new();

        let out = Rc::clone(&output);
        table.register("print", vec![VBType::String], VBType::Void, move |args| {
            let text = string_arg(args, "print")?;
            writeln!(out.borrow_mut(), "{}", text)
                .map_err(|e| ExternError::new(format!("print failed: {}", e)))?;
            Ok(None)
        });

        let mut input = input;
        table.register("ask", vec![VBType::String], VBType::String, move |args| {
            let prompt = string_arg(args, "ask")?;
            {
                let mut out = output.borrow_mut();
                write!(out, "{} ", prompt)
                    .and_then(|_| out.flush())
                    .map_err(|e| ExternError::new(format!("ask failed: {}", e)))?;
            }

            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .map_err(|e| ExternError::new(format!("ask failed: {}", e)))?;
            if read == 0 {
                return Err(ExternError::new("ask: there is no more input to read"));
            }
            Ok(Some(Value::String(
                line.trim_end_matches(['\r', '\n']).to_string(),
            )))
        });

        table
    }

    /// Register (or replace) a host procedure.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        params: Vec<VBType>,
        ret: VBType,
        implementation: F,
    ) -> &mut Self
    where
        F: FnMut(&[Value]) -> ExternResult + 'static,
    {
        self.entries.insert(
            name.into(),
            Extern {
                signature: Signature::new(params, ret),
                implementation: Box::new(implementation),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.entries.get(name).map(|e| &e.signature)
    }

    /// Every signature, for handing to the compiler.
    pub fn signatures(&self) -> HashMap<String, Signature> {
        self.entries
            .iter()
            .map(|(name, e)| (name.clone(), e.signature.clone()))
            .collect()
    }

    /// Invoke `name`; `None` if no such extern is registered.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Option<ExternResult> {
        let entry = self.entries.get_mut(name)?;
        debug!("extern '{}' called with {} argument(s)", name, args.len());
        Some((entry.implementation)(args))
    }
}

impl std::fmt::Debug for ExternTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("ExternTable").field("externs", &names).finish()
    }
}

fn string_arg<'a>(args: &'a [Value], name: &str) -> Result<&'a str, ExternError> {
    match args {
        [Value::String(s)] => Ok(s),
        _ => Err(ExternError::new(format!("{} expects one string", name))),
    }
}
