//! Scope-local sequential identity allocation
//!
//! Every cached activity is a member of exactly one `IdSpace`. Public children
//! share their parent's space while delegate handlers open a child space, so
//! a member is addressed by the chain of ids leading down to it.

use super::error::ValidationError;

/// Largest id a space will hand out
pub const MAX_MEMBER_ID: u32 = i32::MAX as u32;

/// Ordered, append-only member table for one nesting level
#[derive(Debug, Clone)]
pub struct IdSpace<T> {
    parent: Option<usize>,
    parent_id: u32,
    members: Vec<T>,
    limit: u32,
}

impl<T> IdSpace<T> {
    /// Create an empty space nested under `parent` at member `parent_id`.
    ///
    /// The root space has no parent and a `parent_id` of 0.
    pub fn new(parent: Option<usize>, parent_id: u32) -> Self {
        Self {
            parent,
            parent_id,
            members: Vec::new(),
            limit: MAX_MEMBER_ID,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_limit(parent: Option<usize>, parent_id: u32, limit: u32) -> Self {
        Self {
            limit,
            ..Self::new(parent, parent_id)
        }
    }

    /// Append a member and return its 1-based id
    pub fn add_member(&mut self, member: T) -> Result<u32, ValidationError> {
        let next = self.members.len() as u64 + 1;
        if next > self.limit as u64 {
            return Err(ValidationError::IdSpaceOverflow { limit: self.limit });
        }
        self.members.push(member);
        Ok(next as u32)
    }

    /// Member by 1-based id. Returns `None` for 0 or anything out of range.
    pub fn get(&self, id: u32) -> Option<&T> {
        if id == 0 {
            return None;
        }
        self.members.get(id as usize - 1)
    }

    /// Number of members
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Index of the enclosing space
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Id of the member that owns this space within the parent space
    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    /// Members in id order
    pub fn members(&self) -> impl Iterator<Item = &T> {
        self.members.iter()
    }

    /// Clear membership so ids restart at 1
    pub fn dispose(&mut self) {
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential_and_one_based() {
        let mut space = IdSpace::new(None, 0);
        assert_eq!(space.add_member("a").unwrap(), 1);
        assert_eq!(space.add_member("b").unwrap(), 2);
        assert_eq!(space.get(1), Some(&"a"));
        assert_eq!(space.get(2), Some(&"b"));
        assert_eq!(space.get(0), None);
        assert_eq!(space.get(3), None);
        assert_eq!(space.member_count(), 2);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut space = IdSpace::with_limit(Some(0), 4, 2);
        space.add_member(1).unwrap();
        space.add_member(2).unwrap();
        let err = space.add_member(3).unwrap_err();
        assert!(matches!(err, ValidationError::IdSpaceOverflow { limit: 2 }));
        assert_eq!(space.parent(), Some(0));
        assert_eq!(space.parent_id(), 4);
    }

    #[test]
    fn test_dispose_resets_counter() {
        let mut space = IdSpace::new(None, 0);
        space.add_member('x').unwrap();
        space.dispose();
        assert_eq!(space.member_count(), 0);
        assert_eq!(space.get(1), None);
        assert_eq!(space.add_member('y').unwrap(), 1);
    }
}
