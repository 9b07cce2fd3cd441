//! htpasswd-style user lists for HAProxy `userlist` sections.

use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap as Map;

use crate::haproxy::{AuthUser, UserList};
use crate::{Error, Result};

/// Registers one user list per data key of `secret`, named
/// `<secret>-<key>`, and returns the list names. Lists already registered
/// during this pass are reused as is.
///
/// Each non-empty line is either `user:hash` or `user::password`; the
/// latter is kept in clear text.
pub fn basic_auth_users(
    user_lists: &mut Map<String, UserList>,
    secret: &Secret,
) -> Result<Vec<String>> {
    let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
    let mut names = Vec::new();

    for (key, data) in secret.data.iter().flatten() {
        let list_name = format!("{secret_name}-{key}");
        names.push(list_name.clone());

        if user_lists.contains_key(&list_name) {
            continue;
        }

        let users = parse_users(&list_name, &String::from_utf8_lossy(&data.0))?;
        user_lists.insert(
            list_name.clone(),
            UserList {
                name: list_name,
                users,
            },
        );
    }
    Ok(names)
}

fn parse_users(list_name: &str, text: &str) -> Result<Vec<AuthUser>> {
    let invalid = |reason: String| Error::invalid("userlist", list_name, reason);

    let mut users = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((username, rest)) = line.split_once(':') else {
            return Err(invalid("missing ':' on userlist".into()));
        };
        if username.is_empty() {
            return Err(invalid("missing username on userlist".into()));
        }

        let user = match rest.strip_prefix(':') {
            Some(password) => AuthUser {
                username: username.to_string(),
                password: password.to_string(),
                encrypted: false,
            },
            None => AuthUser {
                username: username.to_string(),
                password: rest.to_string(),
                encrypted: true,
            },
        };
        if user.password.is_empty() {
            return Err(invalid(format!("missing '{username}' password on userlist")));
        }
        users.push(user);
    }
    Ok(users)
}
