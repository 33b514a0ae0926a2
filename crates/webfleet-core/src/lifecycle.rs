//! Site lifecycle state machine and input validation.
//!
//! Sites move through defined states via explicit, validated transitions.
//! No transition outside [`SiteStatus::can_transition_to`] is permitted
//! anywhere in the system; the state store re-checks the matrix inside its
//! own transaction so concurrent writers cannot both win.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length of a custom domain name.
const MAX_DOMAIN_LEN: usize = 253;

static SITE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+$").expect("valid pattern"));

static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$")
        .expect("valid pattern")
});

/// Lifecycle state of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteStatus {
    Created,
    Provisioning,
    Active,
    DomainPending,
    DomainValidating,
    DomainRouting,
    DomainActive,
    DomainRemoving,
    Destroying,
    Destroyed,
    Failed,
}

impl SiteStatus {
    /// String form as persisted and exposed over the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Provisioning => "PROVISIONING",
            Self::Active => "ACTIVE",
            Self::DomainPending => "DOMAIN_PENDING",
            Self::DomainValidating => "DOMAIN_VALIDATING",
            Self::DomainRouting => "DOMAIN_ROUTING",
            Self::DomainActive => "DOMAIN_ACTIVE",
            Self::DomainRemoving => "DOMAIN_REMOVING",
            Self::Destroying => "DESTROYING",
            Self::Destroyed => "DESTROYED",
            Self::Failed => "FAILED",
        }
    }

    /// The legal targets reachable from this state.
    #[must_use]
    pub const fn allowed_targets(self) -> &'static [SiteStatus] {
        match self {
            Self::Created => &[Self::Provisioning],
            Self::Provisioning => &[Self::Active, Self::Failed],
            Self::Active => &[Self::DomainPending, Self::Destroying],
            Self::DomainPending => &[Self::DomainValidating, Self::Active],
            Self::DomainValidating => &[Self::DomainRouting, Self::DomainPending, Self::Active],
            Self::DomainRouting => &[Self::DomainActive, Self::Active],
            Self::DomainActive => &[Self::DomainRemoving, Self::Destroying],
            Self::DomainRemoving => &[Self::Active, Self::Failed],
            Self::Destroying => &[Self::Destroyed, Self::Failed],
            Self::Failed => &[Self::Provisioning, Self::Destroying],
            Self::Destroyed => &[],
        }
    }

    /// Whether moving to `target` is a legal edge of the state machine.
    #[must_use]
    pub fn can_transition_to(self, target: SiteStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Whether this is a final state with no outgoing edges.
    ///
    /// Only `DESTROYED` is terminal; a `FAILED` site can be re-provisioned
    /// or destroyed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Whether a custom domain may be attached in this state.
    #[must_use]
    pub const fn allows_custom_domain(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the site can be destroyed from this state.
    #[must_use]
    pub const fn allows_destroy(self) -> bool {
        matches!(self, Self::Active | Self::DomainActive | Self::Failed)
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PROVISIONING" => Ok(Self::Provisioning),
            "ACTIVE" => Ok(Self::Active),
            "DOMAIN_PENDING" => Ok(Self::DomainPending),
            "DOMAIN_VALIDATING" => Ok(Self::DomainValidating),
            "DOMAIN_ROUTING" => Ok(Self::DomainRouting),
            "DOMAIN_ACTIVE" => Ok(Self::DomainActive),
            "DOMAIN_REMOVING" => Ok(Self::DomainRemoving),
            "DESTROYING" => Ok(Self::Destroying),
            "DESTROYED" => Ok(Self::Destroyed),
            "FAILED" => Ok(Self::Failed),
            other => Err(ValidationError::UnknownStatus(other.to_owned())),
        }
    }
}

/// Input validation failures, all rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Site name does not match `^[a-z0-9]+$`.
    #[error("site name must be lowercase letters and numbers only")]
    InvalidSiteName,

    /// Empty domain.
    #[error("domain cannot be empty")]
    EmptyDomain,

    /// Domain longer than 253 characters.
    #[error("domain too long (max {MAX_DOMAIN_LEN} characters)")]
    DomainTooLong,

    /// Wildcard domains are not supported.
    #[error("wildcard domains are not supported")]
    WildcardDomain,

    /// Domain does not match the hostname grammar.
    #[error("invalid domain format: {0}")]
    InvalidDomainFormat(String),

    /// Domain is the base domain or a subdomain of it.
    #[error("cannot use {domain} as custom domain (conflicts with base domain {base})")]
    ConflictsWithBase { domain: String, base: String },

    /// Unrecognised persisted status value.
    #[error("unknown site status: {0}")]
    UnknownStatus(String),
}

/// Validate a site identifier (`^[a-z0-9]+$`).
pub fn validate_site_name(site: &str) -> Result<(), ValidationError> {
    if SITE_NAME_PATTERN.is_match(site) {
        Ok(())
    } else {
        Err(ValidationError::InvalidSiteName)
    }
}

/// Validate custom-domain name format.
pub fn validate_domain_format(domain: &str) -> Result<(), ValidationError> {
    if domain.is_empty() {
        return Err(ValidationError::EmptyDomain);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(ValidationError::DomainTooLong);
    }
    if domain.starts_with("*.") {
        return Err(ValidationError::WildcardDomain);
    }
    if !DOMAIN_PATTERN.is_match(domain) {
        return Err(ValidationError::InvalidDomainFormat(domain.to_owned()));
    }
    Ok(())
}

/// Reject domains that are, or fall under, the fleet's base domain.
pub fn validate_domain_not_base(domain: &str, base_domain: &str) -> Result<(), ValidationError> {
    if domain == base_domain || domain.ends_with(&format!(".{base_domain}")) {
        return Err(ValidationError::ConflictsWithBase {
            domain: domain.to_owned(),
            base: base_domain.to_owned(),
        });
    }
    Ok(())
}

/// All synchronous custom-domain validations.
pub fn validate_custom_domain(domain: &str, base_domain: &str) -> Result<(), ValidationError> {
    validate_domain_format(domain)?;
    validate_domain_not_base(domain, base_domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SiteStatus; 11] = [
        SiteStatus::Created,
        SiteStatus::Provisioning,
        SiteStatus::Active,
        SiteStatus::DomainPending,
        SiteStatus::DomainValidating,
        SiteStatus::DomainRouting,
        SiteStatus::DomainActive,
        SiteStatus::DomainRemoving,
        SiteStatus::Destroying,
        SiteStatus::Destroyed,
        SiteStatus::Failed,
    ];

    #[test]
    fn matrix_matches_definition() {
        use SiteStatus::*;

        let edges = [
            (Created, Provisioning),
            (Provisioning, Active),
            (Provisioning, Failed),
            (Active, DomainPending),
            (Active, Destroying),
            (DomainPending, DomainValidating),
            (DomainPending, Active),
            (DomainValidating, DomainRouting),
            (DomainValidating, DomainPending),
            (DomainValidating, Active),
            (DomainRouting, DomainActive),
            (DomainRouting, Active),
            (DomainActive, DomainRemoving),
            (DomainActive, Destroying),
            (DomainRemoving, Active),
            (DomainRemoving, Failed),
            (Destroying, Destroyed),
            (Destroying, Failed),
            (Failed, Provisioning),
            (Failed, Destroying),
        ];

        for from in ALL {
            for to in ALL {
                let expected = edges.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn destroyed_is_the_only_terminal_state() {
        for status in ALL {
            assert_eq!(status.is_terminal(), status == SiteStatus::Destroyed);
        }
    }

    #[test]
    fn destroy_allowed_from_active_domain_active_failed() {
        assert!(SiteStatus::Active.allows_destroy());
        assert!(SiteStatus::DomainActive.allows_destroy());
        assert!(SiteStatus::Failed.allows_destroy());
        assert!(!SiteStatus::Provisioning.allows_destroy());
        assert!(!SiteStatus::Destroyed.allows_destroy());
    }

    #[test]
    fn custom_domain_only_from_active() {
        for status in ALL {
            assert_eq!(status.allows_custom_domain(), status == SiteStatus::Active);
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<SiteStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<SiteStatus>().is_err());
    }

    #[test]
    fn site_names() {
        assert!(validate_site_name("mysite").is_ok());
        assert!(validate_site_name("a1").is_ok());
        assert!(validate_site_name("").is_err());
        assert!(validate_site_name("MySite").is_err());
        assert!(validate_site_name("my-site").is_err());
        assert!(validate_site_name("my.site").is_err());
    }

    #[test]
    fn domain_format() {
        assert!(validate_domain_format("example.com").is_ok());
        assert!(validate_domain_format("a-b.example.co.uk").is_ok());
        assert!(validate_domain_format("").is_err());
        assert!(validate_domain_format("*.example.com").is_err());
        assert!(validate_domain_format("no_underscores.com").is_err());
        assert!(validate_domain_format("nodots").is_err());
        assert!(validate_domain_format(&format!("{}.com", "a".repeat(260))).is_err());
    }

    #[test]
    fn base_domain_is_rejected() {
        assert!(validate_domain_not_base("example.com", "hosto.com").is_ok());
        assert!(validate_domain_not_base("hosto.com", "hosto.com").is_err());
        assert!(validate_domain_not_base("mysite.hosto.com", "hosto.com").is_err());
        // A name merely ending in the base string is fine.
        assert!(validate_domain_not_base("nothosto.com", "hosto.com").is_ok());
    }
}
