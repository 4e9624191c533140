//! Configuration management
//!
//! Handles config.toml (user-defined) and config.lock (generated with
//! named patterns resolved and defaults filled in), plus construction of
//! a rewriter element from a lock.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::dataplane::{InputSpec, Mapper, PatternSpec, Rewriter};
use crate::telemetry::RewriterMetrics;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Load a generated lock file
pub fn load_lock<P: AsRef<Path>>(path: P) -> Result<ConfigLock> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let lock: ConfigLock = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(lock)
}

/// Generate a lock file from config, resolving names and defaults
pub fn generate_lock(config: &Config, source_content: &str) -> Result<ConfigLock> {
    let source_hash = compute_hash(source_content);
    ConfigLock::from_config(config, source_hash)
}

fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build a rewriter element from a lock file.
///
/// `mappers` supplies the external mapper elements referenced by name;
/// each referenced element is consumed. Inputs referencing the same named
/// pattern share one pattern instance, hence one port pool.
pub fn build_rewriter(
    lock: &ConfigLock,
    mut mappers: HashMap<String, Box<dyn Mapper>>,
    metrics: Arc<RewriterMetrics>,
) -> Result<Rewriter> {
    let mut rewriter = Rewriter::new(lock.outputs, metrics);
    rewriter.set_gc_interval(Duration::from_secs(lock.gc_interval_secs));

    let mut named_indices: HashMap<String, usize> = HashMap::new();
    let mut configured_specs: Vec<PatternSpec> = Vec::new();
    let mut published_specs: Vec<PatternSpec> = Vec::new();

    for input in &lock.inputs {
        let spec = match input.to_parsed()? {
            ParsedInput::Drop => InputSpec::Drop,
            ParsedInput::NoChange { output } => InputSpec::NoChange { output },
            ParsedInput::Pattern {
                name,
                spec,
                foutput,
                routput,
            } => {
                configured_specs.push(spec.clone());
                let pattern = match name {
                    Some(name) => *named_indices
                        .entry(name)
                        .or_insert_with(|| rewriter.add_pattern(spec)),
                    None => rewriter.add_pattern(spec),
                };
                InputSpec::Pattern {
                    pattern,
                    foutput,
                    routput,
                }
            }
            ParsedInput::Mapper { element } => {
                let mapper = mappers
                    .remove(&element)
                    .ok_or(Error::ElementNotFound { name: element })?;
                published_specs.extend(mapper.mapper_patterns());
                InputSpec::Mapper(mapper)
            }
        };
        rewriter.add_input(spec)?;
    }

    // Configured-vs-configured conflicts were reported during validation;
    // patterns published by mapper elements are only known now.
    for published in &published_specs {
        for configured in &configured_specs {
            if published.possible_conflict(configured) {
                warn!(%published, %configured, "mapper pattern may collide with configured pattern");
            }
        }
    }

    Ok(rewriter)
}
