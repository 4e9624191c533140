//! Configuration types
//!
//! `Config` mirrors config.toml; `ConfigLock` is the generated lock file
//! with named patterns resolved and defaults filled in. Input-spec lines
//! use one line per input port:
//!
//! ```text
//! drop
//! nochange [OUTPUT]
//! pattern SADDR SPORT DADDR DPORT FOUTPUT ROUTPUT
//! pattern NAME FOUTPUT ROUTPUT
//! ELEMENTNAME
//! ```

use crate::dataplane::PatternSpec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rewriter: RewriterConfig,
    #[serde(default)]
    pub patterns: HashMap<String, String>,
    #[serde(default)]
    pub log: Option<LogSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriterConfig {
    /// One spec line per input port.
    pub inputs: Vec<String>,
    /// Number of output ports.
    pub outputs: usize,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

fn default_gc_interval() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// One parsed input-spec line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    Drop,
    NoChange {
        output: usize,
    },
    Pattern {
        /// Set when the line referenced a named pattern; inputs sharing a
        /// name share one port pool.
        name: Option<String>,
        spec: PatternSpec,
        foutput: usize,
        routput: usize,
    },
    Mapper {
        element: String,
    },
}

impl ParsedInput {
    /// Parse one input-spec line, resolving named patterns against the
    /// `[patterns]` table.
    pub fn parse(line: &str, named: &HashMap<String, String>) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&word, rest)) = words.split_first() else {
            return Err(Error::Config("input spec is empty".into()));
        };

        match word {
            "drop" => {
                if !rest.is_empty() {
                    return Err(Error::Config("bad input spec; expected `drop'".into()));
                }
                Ok(ParsedInput::Drop)
            }
            "nochange" => {
                let output = match rest {
                    [] => 0,
                    [out] => out.parse().map_err(|_| {
                        Error::Config("bad input spec; expected `nochange [OUTPUT]'".into())
                    })?,
                    _ => {
                        return Err(Error::Config(
                            "bad input spec; expected `nochange [OUTPUT]'".into(),
                        ))
                    }
                };
                Ok(ParsedInput::NoChange { output })
            }
            "pattern" => Self::parse_pattern(rest, named),
            element => {
                if !rest.is_empty() {
                    return Err(Error::Config(
                        "bad input spec; expected `ELEMENTNAME'".into(),
                    ));
                }
                Ok(ParsedInput::Mapper {
                    element: element.to_string(),
                })
            }
        }
    }

    fn parse_pattern(rest: &[&str], named: &HashMap<String, String>) -> Result<Self> {
        // The last two tokens are the forward and reverse outputs.
        let (spec_words, ports) = match rest.len() {
            3 | 6 => rest.split_at(rest.len() - 2),
            _ => {
                return Err(Error::Config(
                    "bad pattern spec: should be `pattern NAME FOUTPUT ROUTPUT' or \
                     `pattern SADDR SPORT DADDR DPORT FOUTPUT ROUTPUT'"
                        .into(),
                ))
            }
        };

        let bad_ports =
            || Error::Config("bad forward and/or reverse ports in pattern spec".into());
        let foutput: usize = ports[0].parse().map_err(|_| bad_ports())?;
        let routput: usize = ports[1].parse().map_err(|_| bad_ports())?;

        let (name, spec) = match spec_words {
            [name] => {
                let definition = named.get(*name).ok_or_else(|| Error::Config(format!(
                    "no pattern named `{}'",
                    name
                )))?;
                let words: Vec<&str> = definition.split_whitespace().collect();
                let spec = PatternSpec::parse(&words)
                    .map_err(|e| Error::Config(format!("pattern `{}': {}", name, e)))?;
                (Some(name.to_string()), spec)
            }
            words => (None, PatternSpec::parse(words)?),
        };

        Ok(ParsedInput::Pattern {
            name,
            spec,
            foutput,
            routput,
        })
    }
}

// ============================================================================
// Lock file types (generated, named patterns resolved, defaults filled in)
// ============================================================================

/// Generated lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub source_hash: String,
    pub outputs: usize,
    pub gc_interval_secs: u64,
    pub inputs: Vec<InputLock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputLock {
    /// drop | nochange | pattern | mapper
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<usize>,
    /// Resolved `SADDR SPORT DADDR DPORT` tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foutput: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routput: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
}

impl ConfigLock {
    pub fn from_config(config: &Config, source_hash: String) -> Result<Self> {
        let mut inputs = Vec::with_capacity(config.rewriter.inputs.len());
        for line in &config.rewriter.inputs {
            let parsed = ParsedInput::parse(line, &config.patterns)?;
            inputs.push(InputLock::from_parsed(&parsed));
        }

        Ok(ConfigLock {
            generated_at: chrono::Utc::now().to_rfc3339(),
            source_hash,
            outputs: config.rewriter.outputs,
            gc_interval_secs: config.rewriter.gc_interval_secs,
            inputs,
        })
    }
}

impl InputLock {
    fn from_parsed(parsed: &ParsedInput) -> Self {
        let empty = InputLock {
            kind: String::new(),
            output: None,
            pattern: None,
            pattern_name: None,
            foutput: None,
            routput: None,
            element: None,
        };

        match parsed {
            ParsedInput::Drop => InputLock {
                kind: "drop".into(),
                ..empty
            },
            ParsedInput::NoChange { output } => InputLock {
                kind: "nochange".into(),
                output: Some(*output),
                ..empty
            },
            ParsedInput::Pattern {
                name,
                spec,
                foutput,
                routput,
            } => InputLock {
                kind: "pattern".into(),
                pattern: Some(spec_tokens(spec)),
                pattern_name: name.clone(),
                foutput: Some(*foutput),
                routput: Some(*routput),
                ..empty
            },
            ParsedInput::Mapper { element } => InputLock {
                kind: "mapper".into(),
                element: Some(element.clone()),
                ..empty
            },
        }
    }

    /// Reconstruct the parsed form when building a rewriter from a lock.
    pub fn to_parsed(&self) -> Result<ParsedInput> {
        match self.kind.as_str() {
            "drop" => Ok(ParsedInput::Drop),
            "nochange" => Ok(ParsedInput::NoChange {
                output: self.output.unwrap_or(0),
            }),
            "pattern" => {
                let definition = self
                    .pattern
                    .as_deref()
                    .ok_or_else(|| Error::Config("pattern input without pattern field".into()))?;
                let words: Vec<&str> = definition.split_whitespace().collect();
                Ok(ParsedInput::Pattern {
                    name: self.pattern_name.clone(),
                    spec: PatternSpec::parse(&words)?,
                    foutput: self.foutput.unwrap_or(0),
                    routput: self.routput.unwrap_or(0),
                })
            }
            "mapper" => Ok(ParsedInput::Mapper {
                element: self
                    .element
                    .clone()
                    .ok_or_else(|| Error::Config("mapper input without element field".into()))?,
            }),
            other => Err(Error::Config(format!("unknown input kind `{}'", other))),
        }
    }
}

/// Render a spec back to its four-token textual form.
fn spec_tokens(spec: &PatternSpec) -> String {
    let saddr = spec
        .saddr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".into());
    let sport = match spec.sport {
        None => "-".into(),
        Some(r) if r.start == r.end => r.start.to_string(),
        Some(r) => format!("{}-{}", r.start, r.end),
    };
    let daddr = spec
        .daddr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".into());
    let dport = spec
        .dport
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".into());
    format!("{} {} {} {}", saddr, sport, daddr, dport)
}
