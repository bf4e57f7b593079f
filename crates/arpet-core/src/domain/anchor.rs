//! Anchors and anchored object types.
//!
//! # Anchor lifecycle
//!
//! ```text
//! LocalAnchor  ──host──►  CloudAnchor  ──share──►  (guest) CloudAnchor  ──resolve──►  ResolvedCloudAnchor
//! ```
//!
//! - A [`LocalAnchor`] is a pose in the host's own tracking frame.
//! - Hosting uploads it and yields a [`CloudAnchor`] carrying the cloud id.
//! - A guest resolves the cloud id into a pose in *its* tracking frame and
//!   receives a [`ResolvedCloudAnchor`] with an opaque handle the renderer can
//!   attach objects to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of `f32` cells in a 4x4 pose matrix.
pub const POSE_LEN: usize = 16;

/// Kind of object an anchor is attached to.
///
/// The set is closed: a code outside this enumeration on the wire is a
/// protocol error rather than a new kind of object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    None = 0,
    Character = 1,
    Bed = 2,
    Bowl = 3,
    Hydrant = 4,
    /// The pet itself; its pose is the shared world center.
    Pet = 5,
}

impl ObjectType {
    /// Upper-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::None => "NONE",
            ObjectType::Character => "CHARACTER",
            ObjectType::Bed => "BED",
            ObjectType::Bowl => "BOWL",
            ObjectType::Hydrant => "HYDRANT",
            ObjectType::Pet => "PET",
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectType::None),
            1 => Ok(ObjectType::Character),
            2 => Ok(ObjectType::Bed),
            3 => Ok(ObjectType::Bowl),
            4 => Ok(ObjectType::Hydrant),
            5 => Ok(ObjectType::Pet),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 4x4 column-major transform matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose(pub [f32; POSE_LEN]);

impl Pose {
    /// The identity transform.
    pub const IDENTITY: Pose = Pose([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// A pure translation.
    pub fn from_translation(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY.0;
        m[12] = x;
        m[13] = y;
        m[14] = z;
        Pose(m)
    }

    /// Returns the translation column `(x, y, z)`.
    pub fn translation(&self) -> (f32, f32, f32) {
        (self.0[12], self.0[13], self.0[14])
    }

    /// Raw matrix cells.
    pub fn as_array(&self) -> &[f32; POSE_LEN] {
        &self.0
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// An anchor that exists only in the local tracking frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAnchor {
    pub object_type: ObjectType,
    pub pose: Pose,
}

impl LocalAnchor {
    pub fn new(object_type: ObjectType, pose: Pose) -> Self {
        Self { object_type, pose }
    }
}

/// An anchor that has been hosted on the cloud anchor service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAnchor {
    /// What the anchor is attached to.
    pub object_type: ObjectType,
    /// Opaque id issued by the cloud anchor service.
    pub cloud_id: String,
    /// Pose of the anchor in the hosting device's frame.
    pub pose: Pose,
}

impl CloudAnchor {
    pub fn new(object_type: ObjectType, cloud_id: impl Into<String>, pose: Pose) -> Self {
        Self {
            object_type,
            cloud_id: cloud_id.into(),
            pose,
        }
    }
}

impl fmt::Display for CloudAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.cloud_id)
    }
}

/// Opaque reference to whatever the renderer attached to a resolved anchor.
///
/// The session layer never interprets the value; it is handed back to the
/// caller so rendering can stay outside of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorHandle(pub u64);

/// A cloud anchor resolved into the local tracking frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCloudAnchor {
    pub anchor: CloudAnchor,
    /// Pose in the resolving device's frame.
    pub resolved_pose: Pose,
    pub handle: AnchorHandle,
}

impl ResolvedCloudAnchor {
    pub fn object_type(&self) -> ObjectType {
        self.anchor.object_type
    }
}

/// Returns the first resolved anchor of the given type.
pub fn find_by_type(
    anchors: &[ResolvedCloudAnchor],
    object_type: ObjectType,
) -> Option<&ResolvedCloudAnchor> {
    anchors.iter().find(|a| a.object_type() == object_type)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_try_from_accepts_every_defined_code() {
        for code in 0u8..=5 {
            let ty = ObjectType::try_from(code).expect("defined code");
            assert_eq!(ty as u8, code);
        }
    }

    #[test]
    fn test_object_type_try_from_rejects_unknown_code() {
        assert!(ObjectType::try_from(6).is_err());
        assert!(ObjectType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_object_type_display_uses_upper_case_name() {
        assert_eq!(ObjectType::Hydrant.to_string(), "HYDRANT");
        assert_eq!(ObjectType::Pet.as_str(), "PET");
    }

    #[test]
    fn test_pose_from_translation_sets_translation_column() {
        // Arrange / Act
        let pose = Pose::from_translation(1.0, -2.0, 3.5);

        // Assert
        assert_eq!(pose.translation(), (1.0, -2.0, 3.5));
        assert_eq!(pose.as_array()[0], 1.0, "rotation part stays identity");
    }

    #[test]
    fn test_pose_default_is_identity() {
        assert_eq!(Pose::default(), Pose::IDENTITY);
    }

    #[test]
    fn test_find_by_type_returns_first_match() {
        // Arrange
        let make = |ty, id: &str, handle| ResolvedCloudAnchor {
            anchor: CloudAnchor::new(ty, id, Pose::IDENTITY),
            resolved_pose: Pose::IDENTITY,
            handle: AnchorHandle(handle),
        };
        let resolved = vec![
            make(ObjectType::Bed, "bed", 1),
            make(ObjectType::Pet, "pet-1", 2),
            make(ObjectType::Pet, "pet-2", 3),
        ];

        // Act
        let found = find_by_type(&resolved, ObjectType::Pet);

        // Assert
        assert_eq!(found.map(|a| a.handle), Some(AnchorHandle(2)));
        assert!(find_by_type(&resolved, ObjectType::Bowl).is_none());
    }

    #[test]
    fn test_cloud_anchor_display_includes_type_and_id() {
        let anchor = CloudAnchor::new(ObjectType::Bowl, "abc", Pose::IDENTITY);
        assert_eq!(anchor.to_string(), "BOWL:abc");
    }
}
