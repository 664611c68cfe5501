use std::collections::HashSet;

pub const ROOM_SEPARATOR: char = '-';

/// Room id shared by two participants: both ids sorted, joined by `-`.
/// `resolve_room(a, b) == resolve_room(b, a)`.
pub fn resolve_room(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}{ROOM_SEPARATOR}{second}")
}

/// Fan-out set of connection ids subscribed to one room or broadcast group.
#[derive(Debug, Clone, Default)]
pub struct Room {
    members: HashSet<String>,
}

impl Room {
    /// Returns `false` if the connection was already a member.
    pub fn add_member(&mut self, connection_id: &str) -> bool {
        self.members.insert(connection_id.to_string())
    }

    pub fn remove_member(&mut self, connection_id: &str) -> bool {
        self.members.remove(connection_id)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.members.contains(connection_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &String> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_order_independent() {
        assert_eq!(resolve_room("alice", "bob"), "alice-bob");
        assert_eq!(resolve_room("bob", "alice"), "alice-bob");
        for (a, b) in [("u1", "u2"), ("Zed", "amy"), ("same", "same"), ("10", "9")] {
            assert_eq!(resolve_room(a, b), resolve_room(b, a));
        }
    }

    #[test]
    fn sorts_as_strings_not_numbers() {
        assert_eq!(resolve_room("10", "9"), "10-9");
    }

    #[test]
    fn membership_is_idempotent() {
        let mut room = Room::default();
        assert!(room.add_member("c1"));
        assert!(!room.add_member("c1"));
        assert_eq!(room.len(), 1);
        assert!(room.remove_member("c1"));
        assert!(!room.remove_member("c1"));
        assert!(room.is_empty());
    }
}
