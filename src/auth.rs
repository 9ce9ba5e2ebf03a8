//! Authorization for the identity collaborator's principals.
//!
//! Authentication happens elsewhere; the core receives an already verified
//! [`Principal`] and only decides what that principal may do.

use crate::{Error, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            "viewer" => Ok(Role::Viewer),
            other => Err(Error::validation("role", format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Principal {
    pub user_id: i64,
    pub workspace_id: uuid::Uuid,
    pub role: Role,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    ViewTemplate,
    CreateTemplate,
    EditTemplate,
    DeactivateTemplate,
    ViewDocument,
    CreateDocument,
    SendDocument,
    CancelDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Workspace(uuid::Uuid),
    Owned { workspace_id: uuid::Uuid, created_by: i64 },
}

impl Resource {
    fn workspace_id(&self) -> uuid::Uuid {
        match self {
            Resource::Workspace(w) => *w,
            Resource::Owned { workspace_id, .. } => *workspace_id,
        }
    }
}

/// What a role may do: on anything in the workspace, or only on resources
/// the principal created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Grant {
    Any,
    Own,
    Never,
}

fn grant(role: Role, action: Action) -> Grant {
    use Action::*;
    match (role, action) {
        (Role::Owner | Role::Admin, _) => Grant::Any,
        (Role::Member, ViewTemplate | CreateTemplate | ViewDocument | CreateDocument) => Grant::Any,
        (Role::Member, EditTemplate | DeactivateTemplate | SendDocument | CancelDocument) => Grant::Own,
        (Role::Viewer, ViewTemplate | ViewDocument) => Grant::Any,
        (Role::Viewer, _) => Grant::Never,
    }
}

/// Resources of another workspace are reported as missing so their existence
/// does not leak.
pub fn authorize(principal: &Principal, action: Action, resource: Resource) -> Result<()> {
    if resource.workspace_id() != principal.workspace_id {
        return Err(Error::NotFound);
    }

    let allowed = match (grant(principal.role, action), resource) {
        (Grant::Any, _) => true,
        (Grant::Own, Resource::Owned { created_by, .. }) => created_by == principal.user_id,
        (Grant::Own, Resource::Workspace(_)) | (Grant::Never, _) => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(Error::Permission(format!("{:?} not permitted for role {:?}", action, principal.role)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Role) -> Principal {
        Principal {
            user_id: 7,
            workspace_id: uuid::Uuid::from_u128(1),
            role,
        }
    }

    fn owned_by(user: i64) -> Resource {
        Resource::Owned {
            workspace_id: uuid::Uuid::from_u128(1),
            created_by: user,
        }
    }

    #[test]
    fn viewers_only_read() {
        let p = principal(Role::Viewer);
        assert!(authorize(&p, Action::ViewTemplate, owned_by(1)).is_ok());
        assert!(matches!(
            authorize(&p, Action::CreateTemplate, Resource::Workspace(p.workspace_id)),
            Err(Error::Permission(_))
        ));
        assert!(matches!(authorize(&p, Action::EditTemplate, owned_by(7)), Err(Error::Permission(_))));
    }

    #[test]
    fn members_manage_their_own() {
        let p = principal(Role::Member);
        assert!(authorize(&p, Action::CreateTemplate, Resource::Workspace(p.workspace_id)).is_ok());
        assert!(authorize(&p, Action::EditTemplate, owned_by(7)).is_ok());
        assert!(matches!(authorize(&p, Action::EditTemplate, owned_by(8)), Err(Error::Permission(_))));
        assert!(matches!(authorize(&p, Action::CancelDocument, owned_by(8)), Err(Error::Permission(_))));
    }

    #[test]
    fn admins_and_owners_manage_everything() {
        for role in [Role::Admin, Role::Owner] {
            let p = principal(role);
            assert!(authorize(&p, Action::EditTemplate, owned_by(8)).is_ok());
            assert!(authorize(&p, Action::SendDocument, owned_by(8)).is_ok());
        }
    }

    #[test]
    fn other_workspaces_look_missing() {
        let p = principal(Role::Owner);
        let foreign = Resource::Owned {
            workspace_id: uuid::Uuid::from_u128(2),
            created_by: 7,
        };
        assert!(matches!(authorize(&p, Action::ViewDocument, foreign), Err(Error::NotFound)));
    }

    #[test]
    fn parses_role_strings() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("superuser".parse::<Role>().is_err());
    }
}
