//! Declarative changes to a [`SecurityDocument`].
//!
//! Each [`Transform`] is a pure function from one document to the next. Removals
//! of entries that do not exist succeed with [`TransformOutcome::Unchanged`] so
//! that deprovisioning can be re-run after a partial failure.

use std::fmt::Display;

use snafu::{Snafu, ensure};

use crate::document::{CATCH_ALL_PERMISSION, OneOrMany, Permission, SecurityDocument};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("cannot assign roles to {username:?}: the user has no credential"))]
    UnknownUser { username: String },

    #[snafu(display("cannot assign an empty role list to {username:?}"))]
    NoRoles { username: String },

    #[snafu(display(
        "cannot remove the credential of {username:?} while the user still has roles assigned"
    ))]
    CredentialInUse { username: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transform {
    /// Sets the stored hash of `username`, replacing an existing one.
    AddCredential { username: String, hash: String },
    RemoveCredential { username: String },

    /// Adds `roles` to the roles of `username`, keeping existing ones.
    AddUserRole { username: String, roles: Vec<String> },
    RemoveUserRole { username: String },

    /// Replaces a permission with the same name in place, otherwise inserts it
    /// before the catch-all `all` permission, otherwise appends it.
    AddPermission { permission: Permission },
    RemovePermission { name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformOutcome {
    Applied,
    Unchanged,
}

impl Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddCredential { username, .. } => write!(f, "add-credential {username}"),
            Self::RemoveCredential { username } => write!(f, "remove-credential {username}"),
            Self::AddUserRole { username, roles } => {
                write!(f, "add-user-role {username} -> [{}]", roles.join(", "))
            }
            Self::RemoveUserRole { username } => write!(f, "remove-user-role {username}"),
            Self::AddPermission { permission } => write!(f, "add-permission {}", permission.name),
            Self::RemovePermission { name } => write!(f, "remove-permission {name}"),
        }
    }
}

impl Transform {
    /// Renders the transform against `document`, returning the new document.
    pub fn apply(&self, document: &SecurityDocument) -> Result<(SecurityDocument, TransformOutcome)> {
        let mut next = document.clone();
        let outcome = match self {
            Self::AddCredential { username, hash } => {
                let previous = next
                    .authentication
                    .credentials
                    .insert(username.clone(), hash.clone());
                changed(previous.as_ref() != Some(hash))
            }
            Self::RemoveCredential { username } => {
                ensure!(
                    !next.authorization.user_role.contains_key(username),
                    CredentialInUseSnafu { username }
                );
                changed(next.authentication.credentials.shift_remove(username).is_some())
            }
            Self::AddUserRole { username, roles } => {
                ensure!(!roles.is_empty(), NoRolesSnafu { username });
                ensure!(
                    next.authentication.credentials.contains_key(username),
                    UnknownUserSnafu { username }
                );

                let mut merged = next
                    .authorization
                    .user_role
                    .get(username)
                    .map(OneOrMany::to_vec)
                    .unwrap_or_default();
                let before = merged.len();
                for role in roles {
                    if !merged.contains(role) {
                        merged.push(role.clone());
                    }
                }
                let added = merged.len() != before;
                let was_present = next.authorization.user_role.contains_key(username);
                next.authorization
                    .user_role
                    .insert(username.clone(), OneOrMany::Many(merged));
                changed(added || !was_present)
            }
            Self::RemoveUserRole { username } => {
                changed(next.authorization.user_role.shift_remove(username).is_some())
            }
            Self::AddPermission { permission } => {
                let permissions = &mut next.authorization.permissions;
                if let Some(existing) = permissions.iter_mut().find(|p| p.name == permission.name) {
                    let differs = existing != permission;
                    *existing = permission.clone();
                    changed(differs)
                } else {
                    let position = permissions
                        .iter()
                        .position(|p| p.name == CATCH_ALL_PERMISSION)
                        .unwrap_or(permissions.len());
                    permissions.insert(position, permission.clone());
                    TransformOutcome::Applied
                }
            }
            Self::RemovePermission { name } => {
                let permissions = &mut next.authorization.permissions;
                let before = permissions.len();
                permissions.retain(|p| &p.name != name);
                changed(permissions.len() != before)
            }
        };

        Ok((next, outcome))
    }
}

fn changed(changed: bool) -> TransformOutcome {
    if changed {
        TransformOutcome::Applied
    } else {
        TransformOutcome::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::document::tests::INITIAL_DOCUMENT;

    const HASH: &str = "oIMsrr/8nbDy7m2DrmWSkBNI2SVvqJvEdDWBwJADQfo= 2SM4iS8mNJbY0qZ+1M7uLAHuxbU26RF19+gqsGnJLsM=";

    #[fixture]
    fn document() -> SecurityDocument {
        SecurityDocument::from_slice(INITIAL_DOCUMENT.as_bytes()).expect("initial document is valid")
    }

    fn add_credential(username: &str) -> Transform {
        Transform::AddCredential {
            username: username.to_owned(),
            hash: HASH.to_owned(),
        }
    }

    #[rstest]
    fn add_credential_then_role(document: SecurityDocument) {
        let (document, outcome) = add_credential("acme_customer")
            .apply(&document)
            .expect("add credential");
        assert_eq!(outcome, TransformOutcome::Applied);

        let (document, outcome) = Transform::AddUserRole {
            username: "acme_customer".to_owned(),
            roles: vec!["acme_role".to_owned()],
        }
        .apply(&document)
        .expect("add user role");
        assert_eq!(outcome, TransformOutcome::Applied);

        assert_eq!(document.credential("acme_customer"), Some(HASH));
        assert_eq!(
            document.roles_of("acme_customer").map(OneOrMany::to_vec),
            Some(vec!["acme_role".to_owned()])
        );
        document.validate().expect("result stays valid");
    }

    #[rstest]
    fn add_user_role_requires_credential(document: SecurityDocument) {
        let error = Transform::AddUserRole {
            username: "ghost".to_owned(),
            roles: vec!["ghost_role".to_owned()],
        }
        .apply(&document)
        .expect_err("user has no credential");

        assert_eq!(
            error,
            Error::UnknownUser {
                username: "ghost".to_owned()
            }
        );
    }

    #[rstest]
    fn add_user_role_merges_existing_roles(document: SecurityDocument) {
        let transform = Transform::AddUserRole {
            username: "admin".to_owned(),
            roles: vec!["admin".to_owned(), "ops".to_owned()],
        };

        let (document, outcome) = transform.apply(&document).expect("merge roles");
        assert_eq!(outcome, TransformOutcome::Applied);
        assert_eq!(
            document.roles_of("admin").map(OneOrMany::to_vec),
            Some(vec!["admin".to_owned(), "ops".to_owned()])
        );

        let (_, outcome) = transform.apply(&document).expect("re-apply merge");
        assert_eq!(outcome, TransformOutcome::Unchanged);
    }

    #[rstest]
    fn permission_is_inserted_before_catch_all(document: SecurityDocument) {
        let permission = Permission::for_collection("acme-access", "acme_role", "moodle_acme", "/*");

        let (document, _) = Transform::AddPermission { permission }
            .apply(&document)
            .expect("add permission");

        let names: Vec<_> = document
            .authorization
            .permissions
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, ["security-edit", "acme-access", "all"]);
    }

    #[rstest]
    fn permission_is_appended_without_catch_all(mut document: SecurityDocument) {
        document
            .authorization
            .permissions
            .retain(|p| p.name != CATCH_ALL_PERMISSION);
        let permission = Permission::for_collection("acme-access", "acme_role", "moodle_acme", "/*");

        let (document, _) = Transform::AddPermission { permission }
            .apply(&document)
            .expect("add permission");

        assert_eq!(
            document
                .authorization
                .permissions
                .last()
                .map(|p| p.name.as_str()),
            Some("acme-access")
        );
    }

    #[rstest]
    fn same_permission_twice_is_unchanged(document: SecurityDocument) {
        let transform = Transform::AddPermission {
            permission: Permission::for_collection("acme-access", "acme_role", "moodle_acme", "/*"),
        };

        let (document, _) = transform.apply(&document).expect("first add");
        let (again, outcome) = transform.apply(&document).expect("second add");

        assert_eq!(outcome, TransformOutcome::Unchanged);
        assert_eq!(again.authorization.permissions.len(), 3);
    }

    #[rstest]
    #[case::credential(Transform::RemoveCredential { username: "nobody".to_owned() })]
    #[case::user_role(Transform::RemoveUserRole { username: "nobody".to_owned() })]
    #[case::permission(Transform::RemovePermission { name: "nobody-access".to_owned() })]
    fn removing_missing_entries_is_unchanged(document: SecurityDocument, #[case] transform: Transform) {
        let (next, outcome) = transform.apply(&document).expect("removal tolerates absence");

        assert_eq!(outcome, TransformOutcome::Unchanged);
        assert_eq!(next, document);
    }

    #[rstest]
    fn credential_in_use_cannot_be_removed(document: SecurityDocument) {
        let error = Transform::RemoveCredential {
            username: "admin".to_owned(),
        }
        .apply(&document)
        .expect_err("admin still has roles");

        assert!(matches!(error, Error::CredentialInUse { .. }));
    }

    #[test]
    fn display_names_the_operation() {
        assert_eq!(add_credential("acme_customer").to_string(), "add-credential acme_customer");
        assert_eq!(
            Transform::AddUserRole {
                username: "acme_customer".to_owned(),
                roles: vec!["acme_role".to_owned()],
            }
            .to_string(),
            "add-user-role acme_customer -> [acme_role]"
        );
    }
}
