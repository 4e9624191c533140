//! Configuration validation
//!
//! All problems are accumulated so a broken config reports everything at
//! once. Pattern inputs additionally go through conflict analysis: two
//! patterns that could hand out the same translated source for the same
//! destination draw a warning, a guaranteed collision is an error.

use super::{Config, ParsedInput};
use crate::dataplane::PatternSpec;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors.
///
/// `known_elements` lists the external mapper elements available to this
/// deployment; an input spec naming anything else is an error.
pub fn validate(config: &Config, known_elements: &[&str]) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_rewriter(config, known_elements, &mut result);
    validate_named_patterns(config, &mut result);

    result
}

fn validate_rewriter(config: &Config, known_elements: &[&str], result: &mut ValidationResult) {
    let rw = &config.rewriter;

    if rw.inputs.is_empty() {
        result.error("rewriter.inputs: expected at least one input spec");
    }
    if rw.outputs == 0 {
        result.error("rewriter.outputs: at least one output port is required");
    }
    if rw.gc_interval_secs == 0 {
        result.error("rewriter.gc_interval_secs: must be positive");
    }

    // (input index, pattern name, spec) for every pattern-kind input, for
    // conflict analysis once all lines are parsed.
    let mut pattern_specs: Vec<(usize, Option<String>, PatternSpec)> = Vec::new();

    for (i, line) in rw.inputs.iter().enumerate() {
        let parsed = match ParsedInput::parse(line, &config.patterns) {
            Ok(parsed) => parsed,
            Err(e) => {
                result.error(format!("rewriter.inputs[{}]: {}", i, e));
                continue;
            }
        };

        match parsed {
            ParsedInput::Drop => {}
            ParsedInput::NoChange { output } => {
                if output >= rw.outputs {
                    result.error(format!(
                        "rewriter.inputs[{}]: output {} out of range (have {})",
                        i, output, rw.outputs
                    ));
                }
            }
            ParsedInput::Pattern {
                name,
                spec,
                foutput,
                routput,
            } => {
                if foutput >= rw.outputs || routput >= rw.outputs {
                    result.error(format!(
                        "rewriter.inputs[{}]: output {}/{} out of range (have {})",
                        i, foutput, routput, rw.outputs
                    ));
                }
                pattern_specs.push((i, name, spec));
            }
            ParsedInput::Mapper { element } => {
                if !known_elements.contains(&element.as_str()) {
                    result.error(format!(
                        "rewriter.inputs[{}]: element {} not found",
                        i, element
                    ));
                }
            }
        }
    }

    check_conflicts(&pattern_specs, result);
}

fn check_conflicts(
    pattern_specs: &[(usize, Option<String>, PatternSpec)],
    result: &mut ValidationResult,
) {
    for (n, (i, name_a, a)) in pattern_specs.iter().enumerate() {
        for (j, name_b, b) in &pattern_specs[n + 1..] {
            if name_a.is_some() && name_a == name_b {
                // Two references to one named pattern share one port pool.
                continue;
            }
            if a.definite_conflict(b) {
                result.error(format!(
                    "rewriter.inputs[{}] and [{}]: patterns `{}' and `{}' always collide",
                    i, j, a, b
                ));
            } else if a.possible_conflict(b) {
                result.warn(format!(
                    "rewriter.inputs[{}] and [{}]: patterns `{}' and `{}' may collide",
                    i, j, a, b
                ));
            }
        }
    }
}

fn validate_named_patterns(config: &Config, result: &mut ValidationResult) {
    for (name, definition) in &config.patterns {
        let words: Vec<&str> = definition.split_whitespace().collect();
        if let Err(e) = PatternSpec::parse(&words) {
            result.error(format!("patterns.{}: {}", name, e));
            continue;
        }

        let referenced = config
            .rewriter
            .inputs
            .iter()
            .any(|line| is_pattern_reference(line, name));
        if !referenced {
            result.warn(format!("patterns.{}: defined but never referenced", name));
        }
    }
}

fn is_pattern_reference(line: &str, name: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    matches!(words.as_slice(), ["pattern", n, _, _] if *n == name)
}
