//! Pipeline configuration: schema, module registry, and the validating
//! builder that produces the immutable routing tree.
//!
//! Only the resolved in-memory configuration is modeled here; parsing
//! a config file into [`PipelineConfig`] is the caller's concern (the
//! schema derives `serde::Deserialize` so any format can drive it).
//! Named checks, modifiers, targets, and tables are resolved against an
//! explicit [`Registry`] value, not a process-wide store.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use postrider_common::{EnhancedCode, SmtpError, Table, address, status::EnhancedCodeParseError};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    check::Check,
    dmarc::{DnsTxtResolver, TxtResolver},
    modify::{Modifier, ModifierGroup},
    pipeline::{MsgPipeline, PipelineInner},
    routing::{RcptAction, RcptBlock, RcptRouting, SourceAction, SourceBlock, TableRoute},
    target::DeliveryTarget,
};

/// Errors detected while building a pipeline from configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The outermost pipeline needs a hostname for trace and result
    /// headers.
    #[error("pipeline hostname is required")]
    MissingHostname,

    /// Every pipeline must define `default_source`.
    #[error("default_source is required")]
    MissingDefaultSource,

    /// A routing source block must define `default_destination`.
    #[error("default_destination is required in a source block that routes recipients")]
    MissingDefaultDestination,

    /// A source block cannot both reject and route.
    #[error("source block configures both reject and destinations")]
    SourceRejectWithRoutes,

    /// A destination block must do exactly one thing.
    #[error("destination block must configure exactly one of deliver_to, reroute, reject")]
    AmbiguousDestinationAction,

    /// Reject replies must be class 4 or 5.
    #[error("reject code {0} is not a class 4 or 5 reply")]
    InvalidRejectCode(u16),

    /// The enhanced code class must agree with the reply code class.
    #[error("enhanced code {enhanced} does not match reply code {code}")]
    RejectCodeMismatch {
        /// The configured reply code.
        code: u16,
        /// The configured enhanced code.
        enhanced: EnhancedCode,
    },

    /// The enhanced code string did not parse.
    #[error(transparent)]
    InvalidEnhancedCode(#[from] EnhancedCodeParseError),

    /// A routing key failed address or domain normalization.
    #[error("invalid routing key {key:?}: {source}")]
    InvalidKey {
        /// The offending key as configured.
        key: String,
        /// Why normalization refused it.
        #[source]
        source: address::AddressError,
    },

    /// The null-sender key `""` only makes sense for sources.
    #[error("the empty routing key is only valid in source blocks")]
    EmptyDestinationKey,

    /// A referenced module name is not registered.
    #[error("unknown {kind} {name:?}")]
    Unknown {
        /// Module kind: `check`, `modifier`, `target`, or `table`.
        kind: &'static str,
        /// The unresolved name.
        name: String,
    },
}

/// Named modules available to a pipeline configuration.
///
/// Passed explicitly to the builder; the pipeline holds `Arc`s to
/// whatever it resolved and the registry can be dropped afterwards.
#[derive(Default)]
pub struct Registry {
    checks: AHashMap<String, Arc<dyn Check>>,
    modifiers: AHashMap<String, Arc<dyn Modifier>>,
    targets: AHashMap<String, Arc<dyn DeliveryTarget>>,
    tables: AHashMap<String, Arc<dyn Table>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("checks", &self.checks.len())
            .field("modifiers", &self.modifiers.len())
            .field("targets", &self.targets.len())
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a check under `name`.
    pub fn register_check(&mut self, name: impl Into<String>, check: Arc<dyn Check>) -> &mut Self {
        self.checks.insert(name.into(), check);
        self
    }

    /// Registers a modifier under `name`.
    pub fn register_modifier(
        &mut self,
        name: impl Into<String>,
        modifier: Arc<dyn Modifier>,
    ) -> &mut Self {
        self.modifiers.insert(name.into(), modifier);
        self
    }

    /// Registers a delivery target under `name`.
    pub fn register_target(
        &mut self,
        name: impl Into<String>,
        target: Arc<dyn DeliveryTarget>,
    ) -> &mut Self {
        self.targets.insert(name.into(), target);
        self
    }

    /// Registers a lookup table under `name`.
    pub fn register_table(&mut self, name: impl Into<String>, table: Arc<dyn Table>) -> &mut Self {
        self.tables.insert(name.into(), table);
        self
    }

    fn check(&self, name: &str) -> Result<Arc<dyn Check>, ConfigError> {
        self.checks.get(name).cloned().ok_or(ConfigError::Unknown {
            kind: "check",
            name: name.to_owned(),
        })
    }

    fn modifier(&self, name: &str) -> Result<Arc<dyn Modifier>, ConfigError> {
        self.modifiers
            .get(name)
            .cloned()
            .ok_or(ConfigError::Unknown {
                kind: "modifier",
                name: name.to_owned(),
            })
    }

    fn target(&self, name: &str) -> Result<Arc<dyn DeliveryTarget>, ConfigError> {
        self.targets.get(name).cloned().ok_or(ConfigError::Unknown {
            kind: "target",
            name: name.to_owned(),
        })
    }

    fn table(&self, name: &str) -> Result<Arc<dyn Table>, ConfigError> {
        self.tables.get(name).cloned().ok_or(ConfigError::Unknown {
            kind: "table",
            name: name.to_owned(),
        })
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Hostname used in `Received:` and `Authentication-Results`.
    /// Nested (reroute) pipelines inherit the outer hostname.
    #[serde(default)]
    pub hostname: String,

    /// Whether the outermost pipeline evaluates DMARC.
    #[serde(default)]
    pub dmarc: bool,

    /// Names of global checks, in declared order.
    #[serde(default)]
    pub check: Vec<String>,

    /// Names of global modifiers, in declared order.
    #[serde(default)]
    pub modify: Vec<String>,

    /// Quarantine the message when the summed score reaches this.
    #[serde(default)]
    pub quarantine_score: Option<i32>,

    /// Reject the message when the summed score reaches this.
    #[serde(default)]
    pub reject_score: Option<i32>,

    /// Table-driven source selection, probed in order.
    #[serde(default)]
    pub source_in: Vec<SourceInRule>,

    /// Keyed source selection (full addresses, domains, or `""` for
    /// the null sender).
    #[serde(default)]
    pub source: Vec<SourceRule>,

    /// Fallback source block. Required.
    pub default_source: Option<SourceConfig>,
}

/// A keyed source entry: several keys may share one block.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRule {
    /// Address, domain, or `""` keys selecting this block.
    pub keys: Vec<String>,
    /// The block itself.
    pub block: SourceConfig,
}

/// A table-driven source entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceInRule {
    /// Name of the registered table to probe.
    pub table: String,
    /// The block selected on a match.
    pub block: SourceConfig,
}

/// One source block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Names of source-scope checks.
    #[serde(default)]
    pub check: Vec<String>,

    /// Names of source-scope modifiers.
    #[serde(default)]
    pub modify: Vec<String>,

    /// Reject everything routed here. Mutually exclusive with any
    /// destination routing.
    #[serde(default)]
    pub reject: Option<RejectConfig>,

    /// Table-driven destination selection, probed in order.
    #[serde(default)]
    pub destination_in: Vec<DestinationInRule>,

    /// Keyed destination selection (full addresses or domains).
    #[serde(default)]
    pub destination: Vec<DestinationRule>,

    /// Fallback destination block. Required unless `reject` is set.
    pub default_destination: Option<DestinationConfig>,
}

/// A keyed destination entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationRule {
    /// Address or domain keys selecting this block.
    pub keys: Vec<String>,
    /// The block itself.
    pub block: DestinationConfig,
}

/// A table-driven destination entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationInRule {
    /// Name of the registered table to probe.
    pub table: String,
    /// The block selected on a match.
    pub block: DestinationConfig,
}

/// One recipient block. Exactly one of `deliver_to`, `reroute`, or
/// `reject` must be configured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationConfig {
    /// Names of recipient-scope checks.
    #[serde(default)]
    pub check: Vec<String>,

    /// Names of recipient-scope modifiers.
    #[serde(default)]
    pub modify: Vec<String>,

    /// Names of delivery targets for recipients routed here.
    #[serde(default)]
    pub deliver_to: Vec<String>,

    /// Nested pipeline to feed recipients through instead.
    #[serde(default)]
    pub reroute: Option<Box<PipelineConfig>>,

    /// Refuse recipients routed here.
    #[serde(default)]
    pub reject: Option<RejectConfig>,
}

/// A configured rejection reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RejectConfig {
    /// Reply code; must be class 4 or 5.
    #[serde(default = "default_reject_code")]
    pub code: u16,

    /// Enhanced code as a string, e.g. `"5.7.1"`. Defaults to
    /// `<class>.7.0`.
    #[serde(default)]
    pub enhanced: Option<String>,

    /// Reply text.
    #[serde(default)]
    pub message: Option<String>,
}

const fn default_reject_code() -> u16 {
    550
}

impl Default for RejectConfig {
    fn default() -> Self {
        Self {
            code: default_reject_code(),
            enhanced: None,
            message: None,
        }
    }
}

pub(crate) fn build_inner(
    registry: &Registry,
    config: &PipelineConfig,
    first_pipeline: bool,
    parent_hostname: Option<&str>,
    resolver: Option<Arc<dyn TxtResolver>>,
) -> Result<PipelineInner, ConfigError> {
    let hostname = if config.hostname.is_empty() {
        parent_hostname
            .map(str::to_owned)
            .ok_or(ConfigError::MissingHostname)?
    } else {
        config.hostname.clone()
    };

    let default_source = config
        .default_source
        .as_ref()
        .ok_or(ConfigError::MissingDefaultSource)?;

    let mut source_map = AHashMap::new();
    for rule in &config.source {
        let block = Arc::new(build_source(registry, &rule.block, &hostname)?);
        for key in &rule.keys {
            source_map.insert(normalize_key(key, true)?, Arc::clone(&block));
        }
    }

    let mut source_lookups = Vec::with_capacity(config.source_in.len());
    for rule in &config.source_in {
        source_lookups.push(TableRoute {
            table: registry.table(&rule.table)?,
            table_name: rule.table.clone(),
            block: Arc::new(build_source(registry, &rule.block, &hostname)?),
        });
    }

    let dmarc = first_pipeline && config.dmarc;
    let resolver = if dmarc {
        Some(resolver.unwrap_or_else(|| Arc::new(DnsTxtResolver::new())))
    } else {
        None
    };

    let default_source = Arc::new(build_source(registry, default_source, &hostname)?);

    Ok(PipelineInner {
        hostname,
        first_pipeline,
        dmarc,
        quarantine_score: config.quarantine_score,
        reject_score: config.reject_score,
        checks: resolve_checks(registry, &config.check)?,
        modifiers: resolve_modifiers(registry, &config.modify)?,
        source_lookups,
        source_map,
        default_source,
        resolver,
    })
}

fn build_source(
    registry: &Registry,
    config: &SourceConfig,
    hostname: &str,
) -> Result<SourceBlock, ConfigError> {
    let action = if let Some(reject) = &config.reject {
        if !config.destination.is_empty()
            || !config.destination_in.is_empty()
            || config.default_destination.is_some()
        {
            return Err(ConfigError::SourceRejectWithRoutes);
        }
        SourceAction::Reject(build_reject(reject)?)
    } else {
        let default = config
            .default_destination
            .as_ref()
            .ok_or(ConfigError::MissingDefaultDestination)?;

        let mut map = AHashMap::new();
        for rule in &config.destination {
            let block = Arc::new(build_destination(registry, &rule.block, hostname)?);
            for key in &rule.keys {
                map.insert(normalize_key(key, false)?, Arc::clone(&block));
            }
        }

        let mut lookups = Vec::with_capacity(config.destination_in.len());
        for rule in &config.destination_in {
            lookups.push(TableRoute {
                table: registry.table(&rule.table)?,
                table_name: rule.table.clone(),
                block: Arc::new(build_destination(registry, &rule.block, hostname)?),
            });
        }

        SourceAction::Route(RcptRouting {
            lookups,
            map,
            default: Arc::new(build_destination(registry, default, hostname)?),
        })
    };

    Ok(SourceBlock {
        checks: resolve_checks(registry, &config.check)?,
        modifiers: resolve_modifiers(registry, &config.modify)?,
        action,
    })
}

fn build_destination(
    registry: &Registry,
    config: &DestinationConfig,
    hostname: &str,
) -> Result<RcptBlock, ConfigError> {
    let configured = usize::from(!config.deliver_to.is_empty())
        + usize::from(config.reroute.is_some())
        + usize::from(config.reject.is_some());
    if configured != 1 {
        return Err(ConfigError::AmbiguousDestinationAction);
    }

    let action = if let Some(reject) = &config.reject {
        RcptAction::Reject(build_reject(reject)?)
    } else if let Some(reroute) = &config.reroute {
        let inner = build_inner(registry, reroute, false, Some(hostname), None)?;
        RcptAction::Reroute(Arc::new(MsgPipeline::from_inner(inner)))
    } else {
        let mut targets = Vec::with_capacity(config.deliver_to.len());
        for name in &config.deliver_to {
            targets.push(registry.target(name)?);
        }
        RcptAction::Deliver(targets)
    };

    Ok(RcptBlock {
        checks: resolve_checks(registry, &config.check)?,
        modifiers: resolve_modifiers(registry, &config.modify)?,
        action,
    })
}

fn resolve_checks(registry: &Registry, names: &[String]) -> Result<Vec<Arc<dyn Check>>, ConfigError> {
    names.iter().map(|name| registry.check(name)).collect()
}

fn resolve_modifiers(registry: &Registry, names: &[String]) -> Result<ModifierGroup, ConfigError> {
    let modifiers = names
        .iter()
        .map(|name| registry.modifier(name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ModifierGroup::new(modifiers))
}

/// Normalizes a routing key at load time so lookups can compare
/// normalized probes against normalized keys byte for byte.
fn normalize_key(key: &str, allow_empty: bool) -> Result<String, ConfigError> {
    if key.is_empty() {
        return if allow_empty {
            Ok(String::new())
        } else {
            Err(ConfigError::EmptyDestinationKey)
        };
    }
    if key.contains('@') || key.eq_ignore_ascii_case(address::POSTMASTER) {
        address::for_lookup(key)
    } else {
        address::domain_for_lookup(key)
    }
    .map_err(|source| ConfigError::InvalidKey {
        key: key.to_owned(),
        source,
    })
}

fn build_reject(config: &RejectConfig) -> Result<SmtpError, ConfigError> {
    if !(400..600).contains(&config.code) {
        return Err(ConfigError::InvalidRejectCode(config.code));
    }
    let enhanced = match &config.enhanced {
        Some(raw) => raw.parse::<EnhancedCode>()?,
        None => EnhancedCode(if config.code >= 500 { 5 } else { 4 }, 7, 0),
    };
    if !enhanced.is_reject_class() || u16::from(enhanced.class()) != config.code / 100 {
        return Err(ConfigError::RejectCodeMismatch {
            code: config.code,
            enhanced,
        });
    }
    let message = config
        .message
        .clone()
        .unwrap_or_else(|| "message rejected due to policy".to_owned());
    Ok(SmtpError::new(config.code, enhanced, message))
}
