use clap::{Parser, Subcommand};
use flownat::config;
use flownat::telemetry::{init_logging, LogConfig, RewriterMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "flownat")]
#[command(about = "A connection-tracked NAPT flow rewriter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the rewriter on a line-based packet stream
    ///
    /// Reads `PORT HEXBYTES` lines from stdin, pushes each packet through
    /// the element and writes `OUTPUT HEXBYTES` (or `drop`) to stdout.
    /// The lines `mappings` and `patterns` print the introspection dumps.
    Run {
        /// Path to config.lock file
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => {
            init_logging(None);
            let result = match action {
                ConfigAction::Generate { config, output } => cmd_config_generate(&config, &output),
                ConfigAction::Validate { config } => cmd_config_validate(&config),
            };
            if let Err(e) = result {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
        Commands::Run { config } => {
            if let Err(e) = cmd_run(&config) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn cmd_config_generate(config_path: &PathBuf, output_path: &PathBuf) -> Result<(), String> {
    info!("Loading {}...", config_path.display());

    let content = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg, &[]);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let lock = config::generate_lock(&cfg, &content)
        .map_err(|e| format!("Failed to generate lock: {}", e))?;

    let lock_toml =
        toml::to_string_pretty(&lock).map_err(|e| format!("Failed to serialize lock: {}", e))?;

    let output = format!(
        "# Generated by flownat - DO NOT EDIT\n# Source: {} (sha256: {})\n\n{}",
        config_path.display(),
        &lock.source_hash[..16],
        lock_toml
    );

    std::fs::write(output_path, output).map_err(|e| format!("Failed to write lock file: {}", e))?;

    info!("Generated {}", output_path.display());
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    info!("Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg, &[]);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        info!("Configuration is valid");
        Ok(())
    }
}

fn cmd_run(lock_path: &PathBuf) -> Result<(), String> {
    use flownat::dataplane::PushAction;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::runtime::Runtime;
    use tracing::{debug, warn};

    init_logging(Some(&LogConfig::default()));
    info!("Loading {}...", lock_path.display());

    let lock = config::load_lock(lock_path).map_err(|e| format!("Failed to load lock: {}", e))?;

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let metrics = Arc::new(RewriterMetrics::new());
        let mut rewriter = config::build_rewriter(&lock, HashMap::new(), metrics.clone())
            .map_err(|e| format!("Failed to configure rewriter: {}", e))?;

        info!(
            inputs = rewriter.ninputs(),
            outputs = rewriter.noutputs(),
            "Rewriter configured"
        );
        let patterns = rewriter.dump_patterns();
        if !patterns.is_empty() {
            info!("Patterns:\n{}", patterns);
        }

        let period = rewriter.gc_interval();
        let mut gc_timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            tokio::select! {
                _ = gc_timer.tick() => {
                    rewriter.tick();
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break, // EOF
                        Err(e) => return Err(format!("stdin error: {}", e)),
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match line {
                        "mappings" => print!("{}", rewriter.dump_mappings()),
                        "patterns" => print!("{}", rewriter.dump_patterns()),
                        _ => match parse_packet_line(line) {
                            Ok((port, mut packet)) => {
                                match rewriter.push(port, &mut packet) {
                                    PushAction::Emit(output) => {
                                        println!("{} {}", output, to_hex(&packet));
                                    }
                                    PushAction::Drop => println!("drop"),
                                }
                            }
                            Err(e) => warn!("ignoring input line: {}", e),
                        },
                    }
                }
            }
        }

        debug!(
            translated = metrics.translated.get(),
            dropped = metrics.dropped.get(),
            "shutting down"
        );
        rewriter.clear();
        Ok(())
    })
}

fn parse_packet_line(line: &str) -> Result<(usize, Vec<u8>), String> {
    let (port, hex) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("expected `PORT HEXBYTES', got `{}'", line))?;
    let port: usize = port
        .parse()
        .map_err(|_| format!("bad input port `{}'", port))?;
    let packet = from_hex(hex.trim())?;
    Ok((port, packet))
}

fn from_hex(s: &str) -> Result<Vec<u8>, String> {
    if !s.is_ascii() {
        return Err("non-ASCII hex string".to_string());
    }
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| format!("bad hex byte at offset {}", i))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}
