//! Users and roles restore: staging collections in `admin`, the merge
//! command, and the `authSchema` version handshake (spec §4.9).

use bson::{doc, Document};

use crate::error::{Error, Result};
use crate::server::ServerHandle;

/// Staging collection names the restore pipeline writes into before
/// invoking the merge command, matching the server's own convention of
/// namespacing temporary restore state under `admin`.
pub const TEMP_USERS_COLLECTION: &str = "tempusers";
pub const TEMP_ROLES_COLLECTION: &str = "temproles";

/// How user/role documents already present on the target server should be
/// reconciled against the ones being restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep existing users/roles untouched, add any from the dump that
    /// don't already exist by name.
    Merge,
    /// Replace the entire users/roles collection with the dump's contents.
    Replace,
}

impl MergeMode {
    fn drop_target(&self) -> bool {
        matches!(self, MergeMode::Replace)
    }
}

/// Stages `users` and `roles` documents in their respective temp
/// collections under `admin`, then invokes the server's merge command.
pub fn restore_users_and_roles(
    server: &dyn ServerHandle,
    users: Vec<Document>,
    roles: Vec<Document>,
    mode: MergeMode,
    target_db: &str,
) -> Result<()> {
    if users.is_empty() && roles.is_empty() {
        // §4.7 point 1: an empty or missing users/roles file means skip
        // entirely, not stage-then-merge-nothing.
        return Ok(());
    }
    stage(server, TEMP_USERS_COLLECTION, users)?;
    stage(server, TEMP_ROLES_COLLECTION, roles)?;

    // §4.7 point 4: `db` scopes the merge to one database; the empty-string
    // sentinel means "all databases", which is what a restore targeting
    // `admin` itself (i.e. not scoped to one database) must send.
    let db = if target_db.is_empty() || target_db == "admin" {
        String::new()
    } else {
        target_db.to_owned()
    };

    let command = doc! {
        "_mergeAuthzCollections": 1,
        "tempUsersCollection": format!("admin.{}", TEMP_USERS_COLLECTION),
        "tempRolesCollection": format!("admin.{}", TEMP_ROLES_COLLECTION),
        "drop": mode.drop_target(),
        "db": db,
    };
    server.run_command("admin", command)?.into_result("admin")?;

    cleanup(server, TEMP_USERS_COLLECTION)?;
    cleanup(server, TEMP_ROLES_COLLECTION)?;
    Ok(())
}

fn stage(server: &dyn ServerHandle, collection: &str, documents: Vec<Document>) -> Result<()> {
    let namespace = crate::namespace::Namespace::new("admin", collection);
    server.drop_collection(&namespace)?;
    if documents.is_empty() {
        return Ok(());
    }
    let results = server.insert_many(&namespace, documents, &crate::common::WriteConcern::default())?;
    for result in results {
        result?;
    }
    Ok(())
}

fn cleanup(server: &dyn ServerHandle, collection: &str) -> Result<()> {
    server.drop_collection(&crate::namespace::Namespace::new("admin", collection))
}

/// The server's reported `authSchema` version. Versions below 3 predate the
/// SCRAM-based credential schema this restore pipeline assumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthSchemaVersion(pub i32);

pub const MIN_SUPPORTED_AUTH_SCHEMA: AuthSchemaVersion = AuthSchemaVersion(3);

/// Reads the target server's `authSchema` version and validates it is new
/// enough to accept a users/roles restore. Per design decision (open
/// question resolved against auto-upgrading): a server still on schema
/// version 1 is not silently upgraded — the caller must run the server's
/// own `authSchemaUpgrade` first. This function only warns and refuses.
pub fn check_auth_schema(server: &dyn ServerHandle) -> Result<AuthSchemaVersion> {
    let reply = server
        .run_command("admin", doc! {"getParameter": 1, "authSchemaVersion": 1})?
        .into_result("admin")?;
    let version = reply
        .get_i32("authSchemaVersion")
        .map_err(|_| Error::format("server did not report an authSchemaVersion"))?;
    let version = AuthSchemaVersion(version);

    if version < MIN_SUPPORTED_AUTH_SCHEMA {
        log::warn!(
            "target server reports authSchema version {}, older than the minimum supported {}; \
             run the server's authSchemaUpgrade before restoring users and roles",
            version.0,
            MIN_SUPPORTED_AUTH_SCHEMA.0
        );
        return Err(Error::validation(format!(
            "authSchema version {} is not supported; upgrade the target server first",
            version.0
        )));
    }
    Ok(version)
}
