//! Resource-string surgery: where a resource lives, what level it names,
//! where its wildcards are allowed to be.
//!
//! Remote resources look like `scheme://host/container/key...?token`.
//! Local resources are plain paths and get none of the URL treatment.

use anyhow::Result;
use camino::Utf8Path;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;
use crate::object::ROOT_TRAILING_SLASH;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Location {
    /// The local filesystem.
    Local,
    /// An object store (flat keys, virtual directories).
    Store,
    /// A cloud file share (first-class directories).
    Share,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LocationLevel {
    /// A whole account: `scheme://host`
    Service,
    /// One bucket/share/container, or a local directory.
    Container,
    /// A single object or local file.
    Object,
}

/// The path portion of a remote resource: everything after `scheme://host/`.
fn remote_path(resource: &str) -> &str {
    let after_scheme = match resource.find("://") {
        Some(i) => &resource[i + 3..],
        None => resource,
    };
    match after_scheme.find('/') {
        Some(i) => &after_scheme[i + 1..],
        None => "",
    }
}

/// The root portion of a resource with any wildcarded suffix stripped.
///
/// Remote resources only tolerate wildcards in the terminal segment, and in
/// the container *or* the object component, never both.
pub fn resource_root(resource: &str, location: Location) -> Result<String> {
    if location == Location::Local {
        return Ok(path_before_wildcard(resource).to_owned());
    }

    let base = match resource.find('?') {
        Some(i) => &resource[..i],
        None => resource,
    };
    let path = remote_path(base);
    if let Some(wild) = path.find('*') {
        // A separator after the first wildcard means the wildcard sat in a
        // non-terminal segment.
        if path[wild..].contains('/') {
            return Err(Error::WildcardInNonTerminalSegment(resource.to_owned()).into());
        }
        let (container, key) = match path.find('/') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => (path, ""),
        };
        if container.contains('*') && key.contains('*') {
            return Err(Error::WildcardInNonTerminalSegment(resource.to_owned()).into());
        }
    }
    Ok(path_before_wildcard(base).to_owned())
}

/// Split the auth token off a remote resource. File shares can't be reached
/// anonymously, so a missing token there is a hard error.
pub fn split_auth(resource: &str, location: Location) -> Result<(String, Option<String>)> {
    let token = resource
        .find('?')
        .map(|i| (&resource[..i], &resource[i + 1..]));
    match token {
        Some((base, token)) if !token.is_empty() => Ok((base.to_owned(), Some(token.to_owned()))),
        _ if location == Location::Share => {
            Err(Error::MissingShareAuth(resource.to_owned()).into())
        }
        Some((base, _)) => Ok((base.to_owned(), None)),
        None => Ok((resource.to_owned(), None)),
    }
}

/// Everything up to and including the last separator before the first `*`.
/// No wildcard, no change.
pub fn path_before_wildcard(path: &str) -> &str {
    match path.find('*') {
        None => path,
        Some(wild) => match path[..wild].rfind(['/', '\\']) {
            Some(sep) => &path[..=sep],
            None => "",
        },
    }
}

/// `foo/*` means "copy the contents into the destination", not
/// "create `foo/` under the destination".
pub fn points_to_contents(path: &str) -> bool {
    path.contains('*')
}

/// Object-store sources allow a single `*`, and only as the terminal
/// component (a prefix search).
pub fn validate_store_wildcards(resource: &str) -> Result<()> {
    let stars = resource.matches('*').count();
    if stars == 0 {
        return Ok(());
    }
    if stars > 1 || !resource.ends_with('*') {
        return Err(Error::InvalidWildcard(resource.to_owned()).into());
    }
    Ok(())
}

/// Does the resource name a whole service, one container, or one object?
///
/// Locals get a stat to tell file from directory; a trailing separator or a
/// wildcard means directory without asking the filesystem.
pub fn location_level(resource: &str, location: Location, _is_source: bool) -> LocationLevel {
    if location == Location::Local {
        if resource.contains('*') || resource.ends_with('/') || resource.ends_with('\\') {
            return LocationLevel::Container;
        }
        return match Utf8Path::new(resource).metadata() {
            Ok(m) if m.is_dir() => LocationLevel::Container,
            // Nonexistent means "a file to be created" on the destination
            // side; source roots that don't exist fail later, at the stat
            // every traversal starts with.
            _ => LocationLevel::Object,
        };
    }

    let base = match resource.find('?') {
        Some(i) => &resource[..i],
        None => resource,
    };
    let path = remote_path(base);
    if path.is_empty() {
        LocationLevel::Service
    } else {
        match path.find('/') {
            None => LocationLevel::Container,
            Some(i) if path[i + 1..].is_empty() => LocationLevel::Container,
            Some(_) => LocationLevel::Object,
        }
    }
}

/// Append a relative path to a resource root, honoring the trailing-slash
/// sentinel.
pub fn combine(root: &str, relative: &str) -> String {
    if relative.is_empty() {
        return root.to_owned();
    }
    let trimmed = root.trim_end_matches('/');
    if relative == ROOT_TRAILING_SLASH {
        return format!("{trimmed}/");
    }
    format!("{trimmed}/{relative}")
}
