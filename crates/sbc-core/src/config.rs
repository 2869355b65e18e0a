//! SBC configuration
//!
//! Every table has defaults, so an empty file is a valid configuration:
//!
//! ```toml
//! user_agent = "edge-sbc"
//! max_packets_per_second = 50
//!
//! [features]
//! local_100rel = true
//!
//! [disconnect]
//! min_connect_time_secs = 2
//! yield_time_secs = 1
//!
//! [registrar]
//! default_expires = 3600
//!
//! [[limits.domains]]
//! domain = "customer.example.com"
//! max_channels = 30
//!
//! [[routes]]
//! pattern = "*@carrier.example.com"
//! target_address = "203.0.113.10"
//! target_transport = "udp"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sbc_sip_core::TransportType;
use sbc_transaction_core::TimerSettings;

use crate::error::{Result, SbcError};
use crate::logging::LoggingSection;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SbcConfig {
    pub timers: TimerConfig,
    pub workers: WorkerConfig,
    pub logging: LoggingSection,
    /// Value of the User-Agent and Server headers stamped on relayed messages
    pub user_agent: String,
    /// Always answer to the packet source instead of the Via sent-by
    pub use_source_address_for_responses: bool,
    /// Admission limit per source IP; zero disables the check
    pub max_packets_per_second: u32,
    pub features: FeatureConfig,
    /// Delayed-disconnect policy for early BYEs; absent means disabled
    pub disconnect: Option<DisconnectConfig>,
    pub reliable: ReliableConfig,
    pub registrar: RegistrarConfig,
    pub limits: LimitsConfig,
    pub cdr: CdrConfig,
    pub routes: Vec<RouteConfig>,
}

impl Default for SbcConfig {
    fn default() -> Self {
        SbcConfig {
            timers: TimerConfig::default(),
            workers: WorkerConfig::default(),
            logging: LoggingSection::default(),
            user_agent: format!("sbc-core/{}", env!("CARGO_PKG_VERSION")),
            use_source_address_for_responses: false,
            max_packets_per_second: 0,
            features: FeatureConfig::default(),
            disconnect: None,
            reliable: ReliableConfig::default(),
            registrar: RegistrarConfig::default(),
            limits: LimitsConfig::default(),
            cdr: CdrConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl SbcConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SbcConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.pool_size == 0 {
            return Err(SbcError::config("workers.pool_size must be at least 1"));
        }
        if self.timers.t1_ms == 0 {
            return Err(SbcError::config("timers.t1_ms must be positive"));
        }
        if self.reliable.tick_ms == 0 {
            return Err(SbcError::config("reliable.tick_ms must be positive"));
        }
        if self.registrar.default_expires == 0 {
            return Err(SbcError::config("registrar.default_expires must be positive"));
        }
        for domain in &self.limits.domains {
            if domain.domain.is_empty() {
                return Err(SbcError::config("limit domain must not be empty"));
            }
        }
        for prefix in &self.limits.prefixes {
            if prefix.prefix.trim().is_empty() {
                return Err(SbcError::config("limit prefix must not be empty"));
            }
        }
        for route in &self.routes {
            route.validate()?;
        }
        Ok(())
    }

    pub fn timer_settings(&self) -> TimerSettings {
        self.timers.to_settings()
    }
}

/// Transaction timer bases in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub timer_d_ms: u64,
    pub max_lifetime_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        let defaults = TimerSettings::default();
        TimerConfig {
            t1_ms: defaults.t1.as_millis() as u64,
            t2_ms: defaults.t2.as_millis() as u64,
            t4_ms: defaults.t4.as_millis() as u64,
            timer_d_ms: defaults.timer_d.as_millis() as u64,
            max_lifetime_ms: defaults.max_lifetime.as_millis() as u64,
        }
    }
}

impl TimerConfig {
    pub fn to_settings(&self) -> TimerSettings {
        TimerSettings {
            t1: Duration::from_millis(self.t1_ms),
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
            timer_d: Duration::from_millis(self.timer_d_ms),
            max_lifetime: Duration::from_millis(self.max_lifetime_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent B2B tasks before dispatch falls back to inline execution
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { pool_size: 64 }
    }
}

/// How the far-end leg's Call-ID relates to the inbound one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CidCorrelation {
    /// Same Call-ID on both legs
    #[default]
    None,
    /// Inbound Call-ID plus a fixed suffix
    B2b,
    /// Fresh Call-ID, inbound one carried in `X-CID`
    XCid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Terminate 100rel on each leg instead of passing it through
    pub local_100rel: bool,
    /// Answer UPDATE locally from the stored session descriptions
    pub local_update: bool,
    /// Do not relay 181 Call Is Being Forwarded
    pub disable_181_relay: bool,
    pub cid_correlation: CidCorrelation,
    pub b2b_cid_suffix: String,
    /// Allow header advertised on the far-end leg when local 100rel or UPDATE is on
    pub allow: String,
    /// Forward OPTIONS addressed to the SBC instead of answering locally
    pub route_options: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            local_100rel: false,
            local_update: false,
            disable_181_relay: false,
            cid_correlation: CidCorrelation::None,
            b2b_cid_suffix: "-leg2".to_string(),
            allow: "SUBSCRIBE, NOTIFY, INVITE, ACK, CANCEL, BYE, REFER, INFO, OPTIONS".to_string(),
            route_options: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectConfig {
    /// Calls shorter than this have their BYE held back
    pub min_connect_time_secs: u64,
    /// How long an early BYE is held back
    pub yield_time_secs: u64,
}

impl DisconnectConfig {
    pub fn min_connect_time(&self) -> Duration {
        Duration::from_secs(self.min_connect_time_secs)
    }

    pub fn yield_time(&self) -> Duration {
        Duration::from_secs(self.yield_time_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    /// Retransmission tick; also the initial retransmit interval
    pub tick_ms: u64,
    pub max_retransmits: u32,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        ReliableConfig { tick_ms: 500, max_retransmits: 10 }
    }
}

impl ReliableConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Expiry requested upstream when the REGISTER names none
    pub default_expires: u32,
    /// Route requests whose Request-URI user has a live binding to that binding
    pub route_by_aor: bool,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig { default_expires: crate::registrar::DEFAULT_EXPIRES, route_by_aor: false }
    }
}

fn enabled() -> bool {
    true
}

/// Concurrent call limits; an empty table disables limiting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub domains: Vec<DomainLimitConfig>,
    pub prefixes: Vec<PrefixLimitConfig>,
}

/// Limit on calls from a From domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainLimitConfig {
    pub domain: String,
    pub max_channels: usize,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

/// Limit on calls to numbers starting with `prefix`; commas list aliases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixLimitConfig {
    pub prefix: String,
    pub max_channels: usize,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdrConfig {
    /// Records of calls that never reached a final state are flushed after this
    pub stale_after_secs: u64,
}

impl Default for CdrConfig {
    fn default() -> Self {
        CdrConfig { stale_after_secs: 300 }
    }
}

impl CdrConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteAction {
    #[default]
    Forward,
    /// Answer with `reject_code` (default 404)
    Reject,
    /// Answer 403 and refuse further packets from the source
    Ban,
    /// Hand the request to the method's local handler
    Local,
}

/// One entry of the static route table.
///
/// Entries are tried in order; the first whose `pattern` matches the
/// Request-URI `user@host` (glob) and whose `methods` list is empty or holds
/// the request method wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub pattern: String,
    pub methods: Vec<String>,
    pub action: RouteAction,
    pub target_address: Option<String>,
    pub target_port: Option<u16>,
    pub target_transport: Option<TransportType>,
    pub interface_address: Option<String>,
    pub interface_port: Option<u16>,
    pub reject_code: Option<u16>,
    pub reject_reason: Option<String>,
    pub disable_nat_compensation: bool,
    pub respond_to_packet_source: bool,
    /// Answer upstream with a local 200 and drop the far end's responses
    pub local_response: bool,
    /// Host that transfer targets in REFER are rewritten to
    pub retarget_refer: Option<String>,
}

impl RouteConfig {
    fn validate(&self) -> Result<()> {
        if self.pattern.is_empty() {
            return Err(SbcError::config("route pattern must not be empty"));
        }
        if let Some(code) = self.reject_code {
            if !(300..700).contains(&code) {
                return Err(SbcError::config(format!("invalid reject code {}", code)));
            }
        }
        Ok(())
    }

    /// Interface address and port as a socket address
    pub fn interface(&self) -> Option<SocketAddr> {
        let ip = self.interface_address.as_deref()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.interface_port.unwrap_or(sbc_sip_core::header::DEFAULT_SIP_PORT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SbcConfig::from_toml_str("").unwrap();
        assert_eq!(config.workers.pool_size, 64);
        assert_eq!(config.reliable.tick_ms, 500);
        assert_eq!(config.reliable.max_retransmits, 10);
        assert!(config.disconnect.is_none());
        assert_eq!(config.timer_settings(), TimerSettings::default());
        assert_eq!(config.features.b2b_cid_suffix, "-leg2");
        assert_eq!(config.registrar.default_expires, 3600);
        assert!(config.limits.domains.is_empty());
        assert_eq!(config.cdr.stale_after(), Duration::from_secs(300));
    }

    #[test]
    fn parses_limits() {
        let config = SbcConfig::from_toml_str(
            r#"
            [registrar]
            default_expires = 600
            route_by_aor = true

            [[limits.domains]]
            domain = "customer.example.com"
            max_channels = 30

            [[limits.prefixes]]
            prefix = "1800,1888"
            max_channels = 4
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.registrar.default_expires, 600);
        assert!(config.registrar.route_by_aor);
        assert_eq!(config.limits.domains[0].max_channels, 30);
        assert!(config.limits.domains[0].enabled);
        assert!(!config.limits.prefixes[0].enabled);
        assert!(SbcConfig::from_toml_str("[[limits.prefixes]]\nprefix = \" \"\nmax_channels = 1").is_err());
    }

    #[test]
    fn parses_full_file() {
        let config = SbcConfig::from_toml_str(
            r#"
            user_agent = "edge"
            max_packets_per_second = 20

            [timers]
            t1_ms = 100

            [features]
            local_100rel = true
            cid_correlation = "x-cid"

            [disconnect]
            min_connect_time_secs = 3
            yield_time_secs = 1

            [[routes]]
            pattern = "*@carrier.example.com"
            methods = ["INVITE"]
            target_address = "203.0.113.10"
            target_port = 5080
            target_transport = "tcp"

            [[routes]]
            pattern = "spam*"
            action = "ban"
            "#,
        )
        .unwrap();

        assert_eq!(config.user_agent, "edge");
        assert_eq!(config.timer_settings().t1, Duration::from_millis(100));
        assert!(config.features.local_100rel);
        assert_eq!(config.features.cid_correlation, CidCorrelation::XCid);
        let disconnect = config.disconnect.unwrap();
        assert_eq!(disconnect.min_connect_time(), Duration::from_secs(3));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].target_transport, Some(TransportType::Tcp));
        assert_eq!(config.routes[1].action, RouteAction::Ban);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(SbcConfig::from_toml_str("[workers]\npool_size = 0").is_err());
        assert!(SbcConfig::from_toml_str("[[routes]]\npattern = \"*\"\nreject_code = 200").is_err());
        assert!(matches!(
            SbcConfig::from_toml_str("user_agent = ["),
            Err(SbcError::TomlDe(_))
        ));
    }

    #[test]
    fn route_interface() {
        let route = RouteConfig {
            pattern: "*".into(),
            interface_address: Some("10.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(route.interface(), Some("10.0.0.1:5060".parse().unwrap()));
    }
}
