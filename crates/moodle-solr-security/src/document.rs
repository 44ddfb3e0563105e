//! Typed model of Solr's `security.json`.
//!
//! Only the parts the tenant workflows touch are modelled as fields. Everything
//! else Solr (or an operator) put into the document is kept in the
//! `extensions` maps and written back unchanged.

use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Name of Solr's predefined catch-all permission. Permissions are matched in
/// order, so anything placed after it never takes effect for requests `all`
/// already covers.
pub const CATCH_ALL_PERMISSION: &str = "all";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read security document {path:?}"))]
    ReadDocument {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("security document is not valid JSON for the expected schema"))]
    ParseDocument { source: serde_json::Error },

    #[snafu(display("failed to serialize security document"))]
    SerializeDocument { source: serde_json::Error },

    #[snafu(display("permission {name:?} is defined more than once"))]
    DuplicatePermission { name: String },

    #[snafu(display("user {username:?} has roles assigned but no credential"))]
    MissingCredential { username: String },

    #[snafu(display(
        "credential of user {username:?} is not in the \"<base64 hash> <base64 salt>\" format"
    ))]
    MalformedCredential { username: String },
}

/// The complete `security.json` document.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SecurityDocument {
    pub authentication: Authentication,
    pub authorization: Authorization,

    #[serde(flatten)]
    pub extensions: IndexMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    pub class: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_unknown: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_credentials: Option<bool>,

    /// Username to `"<base64 hash> <base64 salt>"`.
    #[serde(default)]
    pub credentials: IndexMap<String, String>,

    #[serde(flatten)]
    pub extensions: IndexMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Authorization {
    pub class: String,

    #[serde(default)]
    pub permissions: Vec<Permission>,

    #[serde(default, rename = "user-role")]
    pub user_role: IndexMap<String, OneOrMany>,

    #[serde(flatten)]
    pub extensions: IndexMap<String, Value>,
}

/// One entry of `authorization.permissions`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Permission {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<OneOrMany>,

    /// `None` when the key is absent, `Some(None)` for an explicit `null`
    /// (Solr's way of saying "not collection specific").
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub collection: Option<Option<OneOrMany>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<OneOrMany>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<OneOrMany>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    #[serde(flatten)]
    pub extensions: IndexMap<String, Value>,
}

impl Permission {
    /// A permission granting `role` access to `path` of a single collection.
    pub fn for_collection(
        name: impl Into<String>,
        role: impl Into<String>,
        collection: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: Some(OneOrMany::One(role.into())),
            collection: Some(Some(OneOrMany::One(collection.into()))),
            path: Some(OneOrMany::One(path.into())),
            method: None,
            index: None,
            extensions: IndexMap::new(),
        }
    }

    pub fn grants_role(&self, role: &str) -> bool {
        self.role.as_ref().is_some_and(|roles| roles.contains(role))
    }
}

/// Solr accepts either a single string or a list of strings in most places.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values.as_slice(),
        };
        slice.iter().map(String::as_str)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.iter().any(|candidate| candidate == value)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.iter().map(ToOwned::to_owned).collect()
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(values: Vec<String>) -> Self {
        Self::Many(values)
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        Self::One(value.to_owned())
    }
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl SecurityDocument {
    /// Reads and validates the document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).context(ReadDocumentSnafu { path })?;
        Self::from_slice(&content)
    }

    /// Parses and validates a document.
    pub fn from_slice(content: &[u8]) -> Result<Self> {
        let document: Self = serde_json::from_slice(content).context(ParseDocumentSnafu)?;
        document.validate()?;
        Ok(document)
    }

    /// Renders the document the way it is stored on disk.
    pub fn to_vec_pretty(&self) -> Result<Vec<u8>> {
        let mut rendered = serde_json::to_vec_pretty(self).context(SerializeDocumentSnafu)?;
        rendered.push(b'\n');
        Ok(rendered)
    }

    /// Checks the structural invariants every stored document must satisfy.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for permission in &self.authorization.permissions {
            ensure!(
                seen.insert(permission.name.as_str()),
                DuplicatePermissionSnafu {
                    name: &permission.name
                }
            );
        }

        for username in self.authorization.user_role.keys() {
            ensure!(
                self.authentication.credentials.contains_key(username),
                MissingCredentialSnafu { username }
            );
        }

        for (username, credential) in &self.authentication.credentials {
            ensure!(
                is_well_formed_credential(credential),
                MalformedCredentialSnafu { username }
            );
        }

        Ok(())
    }

    /// Roles assigned to some user that no permission grants anything to.
    ///
    /// These are tolerated in stored documents and only reported.
    pub fn orphan_roles(&self) -> Vec<String> {
        let assigned: BTreeSet<&str> = self
            .authorization
            .user_role
            .values()
            .flat_map(OneOrMany::iter)
            .collect();

        assigned
            .into_iter()
            .filter(|role| {
                !self
                    .authorization
                    .permissions
                    .iter()
                    .any(|permission| permission.grants_role(role))
            })
            .map(ToOwned::to_owned)
            .collect()
    }

    pub fn credential(&self, username: &str) -> Option<&str> {
        self.authentication
            .credentials
            .get(username)
            .map(String::as_str)
    }

    pub fn roles_of(&self, username: &str) -> Option<&OneOrMany> {
        self.authorization.user_role.get(username)
    }

    pub fn permission(&self, name: &str) -> Option<&Permission> {
        self.authorization
            .permissions
            .iter()
            .find(|permission| permission.name == name)
    }
}

fn is_well_formed_credential(credential: &str) -> bool {
    let mut parts = credential.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(hash), Some(salt), None) => {
            STANDARD.decode(hash).is_ok() && STANDARD.decode(salt).is_ok()
        }
        _ => false,
    }
}
