//! Launch configuration: CLI surface and cross-field validation (spec §6).
//!
//! `clap` parses the positional reader counts and the trailing per-child
//! token pairs; everything after that — duplicate tokens, writer/reader
//! consistency, slot cardinality — is cross-field, so it is checked by
//! hand in [`LaunchConfig::validate`] rather than forced through a
//! `clap` value parser.

use clap::Parser;
use met_proto::MetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotName {
    Stim,
    Eye,
    Nsp,
}

pub const SLOTS: [SlotName; 3] = [SlotName::Stim, SlotName::Eye, SlotName::Nsp];

impl SlotName {
    pub fn index(self) -> usize {
        match self {
            SlotName::Stim => 0,
            SlotName::Eye => 1,
            SlotName::Nsp => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotName::Stim => "stim",
            SlotName::Eye => "eye",
            SlotName::Nsp => "nsp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Read,
    Write,
}

/// The parsed, not-yet-validated command line (spec §6).
#[derive(Parser, Debug)]
#[command(name = "met-server", about = "MET signalling coordinator")]
pub struct Cli {
    /// Declared reader count for the stim slot.
    pub r_stim: u8,
    /// Declared reader count for the eye slot.
    pub r_eye: u8,
    /// Declared reader count for the nsp slot.
    pub r_nsp: u8,
    /// Per-child `OPTS_RUNTIME OPTS_CONTROLLER` pairs, two tokens per child.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

/// One child controller's launch-time configuration.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Opaque flags forwarded to the embedding runtime, unparsed.
    pub runtime_opts: String,
    /// This child's declared (slot, role) pairs, in declaration order.
    pub roles: Vec<(SlotName, SlotRole)>,
    /// The first bare token in the controller option string.
    pub function_name: String,
    /// Every other token, in original order, passed through unchanged.
    pub passthrough: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub declared_readers: [u8; 3],
    pub children: Vec<ChildSpec>,
}

fn slot_token(tok: &str) -> Option<(SlotName, SlotRole)> {
    match tok {
        "-rstim" => Some((SlotName::Stim, SlotRole::Read)),
        "-reye" => Some((SlotName::Eye, SlotRole::Read)),
        "-rnsp" => Some((SlotName::Nsp, SlotRole::Read)),
        "-wstim" => Some((SlotName::Stim, SlotRole::Write)),
        "-weye" => Some((SlotName::Eye, SlotRole::Write)),
        "-wnsp" => Some((SlotName::Nsp, SlotRole::Write)),
        _ => None,
    }
}

fn parse_child(runtime_opts: &str, controller_opts: &str) -> Result<ChildSpec, MetError> {
    let tokens: Vec<&str> = controller_opts.split_whitespace().collect();
    let mut roles = Vec::new();
    let mut function_name = None;
    let mut passthrough = Vec::new();
    let mut seen = Vec::new();

    for tok in tokens {
        if seen.contains(&tok) {
            return Err(MetError::Intrn);
        }
        seen.push(tok);

        if let Some(role) = slot_token(tok) {
            roles.push(role);
        } else if function_name.is_none() {
            function_name = Some(tok.to_string());
        } else {
            passthrough.push(tok.to_string());
        }
    }

    Ok(ChildSpec {
        runtime_opts: runtime_opts.to_string(),
        roles,
        function_name: function_name.ok_or(MetError::Intrn)?,
        passthrough,
    })
}

impl LaunchConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, MetError> {
        if cli.rest.len() % 2 != 0 {
            return Err(MetError::Intrn);
        }
        let mut children = Vec::with_capacity(cli.rest.len() / 2);
        for pair in cli.rest.chunks_exact(2) {
            children.push(parse_child(&pair[0], &pair[1])?);
        }

        let config = LaunchConfig {
            declared_readers: [cli.r_stim, cli.r_eye, cli.r_nsp],
            children,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation (spec §6): per-slot reader counts must match
    /// declarations, at most one writer per slot, and a slot with any
    /// declared reader must have exactly one writer and vice versa.
    fn validate(&self) -> Result<(), MetError> {
        if self.children.is_empty() || self.children.len() > met_proto::MAX_CONTROLLERS as usize {
            return Err(MetError::Intrn);
        }

        for slot in SLOTS {
            let readers = self.count_role(slot, SlotRole::Read);
            let writers = self.count_role(slot, SlotRole::Write);

            if readers != self.declared_readers[slot.index()] as usize {
                return Err(MetError::Intrn);
            }
            if writers > 1 {
                return Err(MetError::Intrn);
            }
            if writers == 1 && readers == 0 {
                return Err(MetError::Intrn);
            }
            if readers > 0 && writers == 0 {
                return Err(MetError::Intrn);
            }
        }
        Ok(())
    }

    fn count_role(&self, slot: SlotName, role: SlotRole) -> usize {
        self.children
            .iter()
            .filter(|c| c.roles.contains(&(slot, role)))
            .count()
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }
}
