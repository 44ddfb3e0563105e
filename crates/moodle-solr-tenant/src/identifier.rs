//! Tenant identifiers and the names derived from them.

use std::{fmt::Display, str::FromStr, sync::LazyLock};

use regex::Regex;
use snafu::{Snafu, ensure};

const TENANT_ID_FMT: &str = "[a-z0-9_]{1,30}";

static TENANT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{TENANT_ID_FMT}$")).expect("failed to compile tenant identifier regex")
});

pub const CORE_PREFIX: &str = "moodle_";
pub const USERNAME_SUFFIX: &str = "_customer";
pub const ROLE_SUFFIX: &str = "_role";
pub const PERMISSION_SUFFIX: &str = "-access";

/// Every tenant may access every path of its own core.
pub const PERMISSION_PATH: &str = "/*";

#[derive(Debug, PartialEq, Eq, Snafu)]
#[snafu(display(
    "invalid tenant identifier {input:?}: only lowercase letters, digits and '_' are allowed, \
     at most 30 characters (regex used for validation is '{TENANT_ID_FMT}')"
))]
pub struct InvalidIdentifier {
    input: String,
}

/// A validated tenant identifier such as `acme`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(String);

impl FromStr for TenantId {
    type Err = InvalidIdentifier;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ensure!(TENANT_ID_REGEX.is_match(input), InvalidIdentifierSnafu { input });
        Ok(Self(input.to_owned()))
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the tenant from a core name like `moodle_acme`.
    pub fn from_core(core: &str) -> Option<Self> {
        core.strip_prefix(CORE_PREFIX)?.parse().ok()
    }

    /// Recovers the tenant from a username like `acme_customer`.
    pub fn from_username(username: &str) -> Option<Self> {
        username.strip_suffix(USERNAME_SUFFIX)?.parse().ok()
    }

    /// Recovers the tenant from a permission name like `acme-access`.
    pub fn from_permission(permission: &str) -> Option<Self> {
        permission.strip_suffix(PERMISSION_SUFFIX)?.parse().ok()
    }

    pub fn names(&self) -> TenantNames {
        TenantNames {
            core: format!("{CORE_PREFIX}{self}"),
            username: format!("{self}{USERNAME_SUFFIX}"),
            role: format!("{self}{ROLE_SUFFIX}"),
            permission: format!("{self}{PERMISSION_SUFFIX}"),
            id: self.clone(),
        }
    }
}

/// The Solr core and security document entries belonging to one tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantNames {
    pub id: TenantId,
    pub core: String,
    pub username: String,
    pub role: String,
    pub permission: String,
}
