use anyhow::{bail, Context, Result};
use log::debug;
use std::ffi::OsString;

use crate::discovery::MonitorProcess;

pub trait Filter: std::fmt::Debug {
    fn eval(&self, p: &MonitorProcess) -> bool;
}

#[derive(Debug)]
struct NotFilter {
    inner: Box<dyn Filter>,
}
impl Filter for NotFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        !self.inner.eval(p)
    }
}

#[derive(Debug)]
struct TrueFilter;
impl Filter for TrueFilter {
    fn eval(&self, _p: &MonitorProcess) -> bool {
        true
    }
}

#[derive(Debug)]
struct FalseFilter;
impl Filter for FalseFilter {
    fn eval(&self, _p: &MonitorProcess) -> bool {
        false
    }
}

#[derive(Debug)]
struct AndFilter {
    pub children: Vec<Box<dyn Filter>>,
}
impl Filter for AndFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        self.children.iter().all(|child| child.eval(p))
    }
}

#[derive(Debug)]
struct OrFilter {
    pub children: Vec<Box<dyn Filter>>,
}
impl Filter for OrFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        self.children.iter().any(|child| child.eval(p))
    }
}

#[derive(Debug)]
struct SidFilter {
    pub sid: String,
}
impl Filter for SidFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        p.sid()
            .map(|sid| sid.eq_ignore_ascii_case(&self.sid))
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct UidFilter {
    pub uid: u32,
}
impl Filter for UidFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        p.uid == self.uid
    }
}

#[derive(Debug)]
struct PidFilter {
    pub pid: i32,
}
impl Filter for PidFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        self.pid == p.pid
    }
}

#[derive(Debug)]
pub struct EnvironKFilter {
    pub key: String,
}
impl Filter for EnvironKFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        p.environ.contains_key(&OsString::from(&self.key))
    }
}

#[derive(Debug)]
pub struct EnvironKVFilter {
    pub key: String,
    pub value: String,
}
impl Filter for EnvironKVFilter {
    fn eval(&self, p: &MonitorProcess) -> bool {
        p.environ.get(&OsString::from(&self.key)) == Some(&OsString::from(&self.value))
    }
}

/// Parse a whole expression, trailing characters are an error
pub fn parse_filter(input: &str) -> Result<Box<dyn Filter>> {
    if !input.is_ascii() {
        bail!("Filter must be ASCII");
    }
    let (filter, ate) = parse(input).with_context(|| format!("Invalid filter {input:?}"))?;
    if ate != input.len() {
        bail!("Unexpected trailing characters {:?}", &input[ate..]);
    }
    Ok(filter)
}

/// uid(1001)
/// sid(ORCL_1)
/// env_kv(ORACLE_HOME, /u01/app/oracle/product/19c)
/// or(uid(1001), uid(1002))
/// and(env_k(ORACLE_HOME), not(sid(TEST)))
/// limitations:
/// - ASCII only
/// - vars can't contain ()
///
/// Return the filter and the number of bytes consumed
pub fn parse(input: &str) -> Result<(Box<dyn Filter>, usize)> {
    debug!("Parsing: {input:?}");

    let opening = input
        .find('(')
        .with_context(|| "Missing opening parenthesis")?;

    let name = input[..opening].trim();
    debug!("operator: {:?}", name);

    fn find_match_par(input: &str, idx: usize) -> Result<usize> {
        let mut counter = 0;
        let mut iter = input.char_indices().skip(idx);
        loop {
            let Some((idx, c)) = iter.next() else {
                bail!("Unbalanced parenthesis at end of string");
            };

            match c {
                '(' => counter += 1,
                ')' => counter -= 1,
                _ => (),
            }

            if counter < 0 {
                bail!("Too many closing parenthesis");
            }
            if counter == 0 {
                return Ok(idx);
            }
        }
    }

    let closing = find_match_par(input, opening)?;
    let inner = &input[opening + 1..closing];
    debug!("inner: {inner:?}");

    let ate = closing + 1;

    match name {
        "and" | "or" => {
            let mut from = 0;
            let mut inners = Vec::new();
            while from < inner.len() {
                let rest = inner[from..].trim_start();
                let skipped = inner.len() - from - rest.len();
                let Ok((parsed_inner, inner_ate)) = parse(rest) else {
                    bail!("Can't parse {:?}", rest);
                };
                inners.push(parsed_inner);
                from += skipped + inner_ate;

                // separator
                let rest = &inner[from..];
                let trimmed = rest.trim_start();
                from += rest.len() - trimmed.len();
                if trimmed.starts_with(',') {
                    from += 1;
                } else if !trimmed.is_empty() {
                    bail!("Expected ',' before {trimmed:?}");
                }
            }
            if inners.is_empty() {
                bail!("Empty filter for {name:?}");
            }

            if name == "and" {
                Ok((Box::new(AndFilter { children: inners }), ate))
            } else {
                Ok((Box::new(OrFilter { children: inners }), ate))
            }
        }
        "not" => {
            let inner = inner.trim();
            let (parsed_inner, ate_2) = parse(inner)?;
            if ate_2 < inner.len() {
                bail!("Unexpected trailing characters {:?} in not(..)", &inner[ate_2..]);
            }
            Ok((
                Box::new(NotFilter {
                    inner: parsed_inner,
                }),
                ate,
            ))
        }
        "sid" => Ok((
            Box::new(SidFilter {
                sid: inner.trim().to_string(),
            }),
            ate,
        )),
        "pid" => {
            let pid = inner
                .trim()
                .parse()
                .with_context(|| "Argument of 'pid' filter must be a number")?;
            Ok((Box::new(PidFilter { pid }), ate))
        }
        "uid" => {
            let uid = inner
                .trim()
                .parse()
                .with_context(|| "Argument of 'uid' filter must be a number")?;
            Ok((Box::new(UidFilter { uid }), ate))
        }
        "env_kv" => {
            let mut iter = inner.splitn(2, ',');
            let key = iter
                .next()
                .with_context(|| "Invalid key for env_kv")?
                .trim()
                .to_string();
            let value = iter
                .next()
                .with_context(|| "Invalid value for env_kv")?
                .trim()
                .to_string();
            Ok((Box::new(EnvironKVFilter { key, value }), ate))
        }
        "env_k" => {
            let key = inner.trim().to_string();
            Ok((Box::new(EnvironKFilter { key }), ate))
        }
        "true" => Ok((Box::new(TrueFilter), ate)),
        "false" => Ok((Box::new(FalseFilter), ate)),
        x => bail!("Unknown filter: {x:?}"),
    }
}
