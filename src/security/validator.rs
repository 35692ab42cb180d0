//! Allow-list validation for server launch commands.

use crate::config::LaunchConfig;
use crate::error::LaunchRejection;
use std::collections::HashSet;

const METACHARS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '>', '<', '\n', '\r'];

/// `-abc` style bundle of single-letter flags.
fn short_cluster(arg: &str) -> Option<&str> {
    let letters = arg.strip_prefix('-')?;
    (letters.len() >= 2 && letters.chars().all(|c| c.is_ascii_alphabetic())).then_some(letters)
}

/// A command that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Permitted `NAME=value` assignments before the program.
    pub assignments: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LaunchValidator {
    allowed: HashSet<String>,
    forbidden_args: HashSet<String>,
    forbidden_env: HashSet<String>,
}

fn assignment(token: &str) -> Option<(&str, &str)> {
    let (name, value) = token.split_once('=')?;
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some((name, value))
}

impl LaunchValidator {
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            allowed: config.allowed_binaries.iter().cloned().collect(),
            forbidden_args: config.forbidden_args.iter().cloned().collect(),
            forbidden_env: config.forbidden_env_vars.iter().cloned().collect(),
        }
    }

    pub fn validate(&self, command: &str) -> Result<ValidatedCommand, LaunchRejection> {
        if command.trim().is_empty() {
            return Err(LaunchRejection::Empty);
        }
        if let Some(c) = command.chars().find(|c| METACHARS.contains(c)) {
            return Err(LaunchRejection::ShellMetacharacter(c));
        }
        let tokens = shell_words::split(command).map_err(|e| LaunchRejection::Unparseable(e.to_string()))?;
        if tokens.is_empty() {
            return Err(LaunchRejection::Empty);
        }

        let mut assignments = Vec::new();
        let mut rest = tokens.as_slice();
        while let Some((head, tail)) = rest.split_first() {
            let Some((name, value)) = assignment(head) else {
                break;
            };
            self.check_env(name)?;
            assignments.push((name.to_string(), value.to_string()));
            rest = tail;
        }
        let (program, args) = rest.split_first().ok_or(LaunchRejection::Empty)?;

        if program.contains('/') {
            return Err(LaunchRejection::PathInExecutable(program.clone()));
        }
        if !self.allowed.contains(program) {
            return Err(LaunchRejection::BinaryNotAllowed(program.clone()));
        }
        for arg in args {
            self.check_arg(arg)?;
            if let Some((name, _)) = assignment(arg) {
                self.check_env(name)?;
            }
        }

        Ok(ValidatedCommand {
            program: program.clone(),
            args: args.to_vec(),
            assignments,
        })
    }

    fn check_env(&self, name: &str) -> Result<(), LaunchRejection> {
        if self.forbidden_env.contains(name) {
            return Err(LaunchRejection::ForbiddenEnvVar(name.to_string()));
        }
        Ok(())
    }

    fn check_arg(&self, arg: &str) -> Result<(), LaunchRejection> {
        if self.forbidden_args.contains(arg) {
            return Err(LaunchRejection::ForbiddenArgument(arg.to_string()));
        }
        if let Some((flag, _)) = arg.split_once('=') {
            if flag.starts_with('-') && self.forbidden_args.contains(flag) {
                return Err(LaunchRejection::ForbiddenArgument(arg.to_string()));
            }
        }
        if let Some(letters) = short_cluster(arg) {
            let hit = letters
                .chars()
                .any(|c| self.forbidden_args.contains(&format!("-{}", c)));
            if hit {
                return Err(LaunchRejection::ForbiddenArgument(arg.to_string()));
            }
        }
        Ok(())
    }
}
