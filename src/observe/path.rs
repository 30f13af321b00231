// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LWM2M resource paths.

use std::fmt;
use std::str::FromStr;

use crate::error::ObservationError;

/// A path of the form `type[/instance[/resource]]`.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::observe::ResourcePath;
///
/// let path: ResourcePath = "/3303/0/5700".parse().unwrap();
/// assert_eq!(path.object_type(), 3303);
/// assert_eq!(path.to_string(), "3303/0/5700");
///
/// let scope = ResourcePath::object(3303).with_instance(0);
/// assert!(path.is_within(&scope));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    object_type: u16,
    instance_id: Option<u16>,
    resource_id: Option<u16>,
}

impl ResourcePath {
    /// Path to every instance of an object type.
    #[must_use]
    pub const fn object(object_type: u16) -> Self {
        Self {
            object_type,
            instance_id: None,
            resource_id: None,
        }
    }

    /// Narrows the path to one instance.
    #[must_use]
    pub const fn with_instance(mut self, instance_id: u16) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Narrows the path to one resource. Ignored unless an instance is set.
    #[must_use]
    pub const fn with_resource(mut self, resource_id: u16) -> Self {
        if self.instance_id.is_some() {
            self.resource_id = Some(resource_id);
        }
        self
    }

    /// Builds a path from optional parts.
    #[must_use]
    pub fn new(object_type: u16, instance_id: Option<u16>, resource_id: Option<u16>) -> Self {
        let mut path = Self::object(object_type);
        if let Some(instance) = instance_id {
            path = path.with_instance(instance);
            if let Some(resource) = resource_id {
                path = path.with_resource(resource);
            }
        }
        path
    }

    /// Object type.
    #[must_use]
    pub const fn object_type(&self) -> u16 {
        self.object_type
    }

    /// Instance, if the path is that specific.
    #[must_use]
    pub const fn instance_id(&self) -> Option<u16> {
        self.instance_id
    }

    /// Resource, if the path is that specific.
    #[must_use]
    pub const fn resource_id(&self) -> Option<u16> {
        self.resource_id
    }

    /// Returns `true` if `self` equals `scope` or lies below it.
    #[must_use]
    pub fn is_within(&self, scope: &ResourcePath) -> bool {
        self.object_type == scope.object_type
            && scope.instance_id.is_none_or(|i| self.instance_id == Some(i))
            && scope.resource_id.is_none_or(|r| self.resource_id == Some(r))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_type)?;
        if let Some(instance) = self.instance_id {
            write!(f, "/{instance}")?;
        }
        if let Some(resource) = self.resource_id {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = ObservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ObservationError::InvalidPath(s.to_string());
        let trimmed = s.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut parts = trimmed.split('/').map(str::parse::<u16>);
        let object_type = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let instance_id = parts.next().transpose().map_err(|_| invalid())?;
        let resource_id = parts.next().transpose().map_err(|_| invalid())?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(object_type, instance_id, resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for text in ["3303", "3303/0", "3303/0/5700"] {
            let path: ResourcePath = text.parse().unwrap();
            assert_eq!(path.to_string(), text);
        }
        let path: ResourcePath = "/1/2/".parse().unwrap();
        assert_eq!(path, ResourcePath::object(1).with_instance(2));
    }

    #[test]
    fn parse_rejects_garbage() {
        for text in ["", "/", "abc", "3303/x", "1/2/3/4", "70000"] {
            assert!(
                matches!(text.parse::<ResourcePath>(), Err(ObservationError::InvalidPath(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn resource_needs_instance() {
        let path = ResourcePath::object(3).with_resource(1);
        assert_eq!(path.resource_id(), None);
    }

    #[test]
    fn scoping() {
        let resource = ResourcePath::new(3303, Some(0), Some(5700));
        let instance = ResourcePath::new(3303, Some(0), None);
        let object = ResourcePath::object(3303);

        assert!(resource.is_within(&instance));
        assert!(resource.is_within(&object));
        assert!(instance.is_within(&object));
        assert!(!object.is_within(&instance));
        assert!(!resource.is_within(&ResourcePath::new(3303, Some(1), None)));
        assert!(!resource.is_within(&ResourcePath::object(3304)));
    }
}
