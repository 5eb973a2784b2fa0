//! Proxy configuration file.
//!
//! Line-oriented: `label method args…`. The label names a vantage point
//! (`us`, `de_berlin`); the method is `direct` (no tunnel) or `ovpn` (an
//! OpenVPN tunnel whose first argument is a glob over config files, consumed
//! round-robin). Lines starting with `#` and blank lines are ignored.

use std::collections::VecDeque;
use std::path::PathBuf;

use rand::seq::SliceRandom;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyConfigError {
    #[error("line {lineno}: bad proxy label {label:?}")]
    BadLabel { lineno: usize, label: String },
    #[error("line {lineno}: unknown proxy method {method:?}")]
    UnknownMethod { lineno: usize, method: String },
    #[error("line {lineno}: method {method} requires arguments")]
    MissingArgs { lineno: usize, method: String },
    #[error("line {lineno}: {pattern:?} does not match any config files")]
    EmptyGlob { lineno: usize, pattern: String },
    #[error("line {lineno}: bad glob pattern: {source}")]
    BadGlob {
        lineno: usize,
        source: glob::PatternError,
    },
    #[error("duplicate proxy label {label:?}")]
    DuplicateLabel { label: String },
}

/// How a vantage point reaches the network.
#[derive(Debug, Clone)]
pub enum ProxyMethod {
    /// Traffic emanates directly from this machine.
    Direct,
    /// OpenVPN tunnel; configs are consumed round-robin across restarts.
    Openvpn {
        configs: VecDeque<PathBuf>,
        extra_args: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub label: String,
    pub method: ProxyMethod,
}

/// Parse the proxy configuration file contents.
pub fn parse_proxy_config(text: &str) -> Result<Vec<ProxySpec>, ProxyConfigError> {
    let label_re = Regex::new(r"^[a-z]{2,3}(?:_[a-z0-9_]+)?$").unwrap();
    let mut specs: Vec<ProxySpec> = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let label = fields.next().unwrap_or_default().to_string();
        let method = fields.next().unwrap_or_default().to_string();
        let args: Vec<String> = fields.map(str::to_string).collect();

        if !label_re.is_match(&label) {
            return Err(ProxyConfigError::BadLabel { lineno, label });
        }
        if specs.iter().any(|s| s.label == label) {
            return Err(ProxyConfigError::DuplicateLabel { label });
        }

        let method = match method.as_str() {
            "direct" => ProxyMethod::Direct,
            "ovpn" => {
                let pattern = args.first().ok_or(ProxyConfigError::MissingArgs {
                    lineno,
                    method: "ovpn".to_string(),
                })?;
                let mut configs: Vec<PathBuf> = glob::glob(pattern)
                    .map_err(|source| ProxyConfigError::BadGlob { lineno, source })?
                    .filter_map(Result::ok)
                    .collect();
                if configs.is_empty() {
                    return Err(ProxyConfigError::EmptyGlob {
                        lineno,
                        pattern: pattern.clone(),
                    });
                }
                // Start each run at a random point in the rotation so
                // restarts don't hammer the same endpoint.
                configs.shuffle(&mut rand::thread_rng());
                ProxyMethod::Openvpn {
                    configs: configs.into(),
                    extra_args: args[1..].to_vec(),
                }
            }
            other => {
                return Err(ProxyConfigError::UnknownMethod {
                    lineno,
                    method: other.to_string(),
                })
            }
        };

        specs.push(ProxySpec { label, method });
    }

    Ok(specs)
}
