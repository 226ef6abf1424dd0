//! Per-caller asset visibility.
//!
//! Role membership is decided upstream; this module only evaluates an
//! asset's visibility tag against the roles it is given.

use crate::models::Asset;

/// Request header carrying the caller's roles, set by the auth proxy.
pub const ROLES_HEADER: &str = "X-User-Roles";

pub trait Visibility {
    fn can_see(&self, asset: &Asset) -> bool;
}

impl<F> Visibility for F
where
    F: Fn(&Asset) -> bool,
{
    fn can_see(&self, asset: &Asset) -> bool {
        self(asset)
    }
}

/// Sees every asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Visibility for AllowAll {
    fn can_see(&self, _asset: &Asset) -> bool {
        true
    }
}

/// Matches caller roles against the asset's visibility tag.
///
/// Untagged assets are public. A caller without roles sees everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleVisibility {
    roles: Vec<String>,
}

impl RoleVisibility {
    pub fn new<I, R>(roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: AsRef<str>,
    {
        Self {
            roles: roles
                .into_iter()
                .map(|r| r.as_ref().trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Parses a comma or whitespace separated role list.
    pub fn from_header(value: Option<&str>) -> Self {
        Self::new(value.map(tokens).into_iter().flatten())
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }
}

fn tokens(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
}

impl Visibility for RoleVisibility {
    fn can_see(&self, asset: &Asset) -> bool {
        if self.roles.is_empty() {
            return true;
        }
        match asset.visibility.as_deref() {
            None => true,
            Some(tag) => tokens(tag)
                .map(str::to_lowercase)
                .any(|t| self.roles.contains(&t)),
        }
    }
}
