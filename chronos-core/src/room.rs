//! Room identifiers and the producer-side room registry.
//!
//! Room codes are 5-character uppercase alphanumerics, generated from a
//! restricted alphabet that drops the confusable glyphs (`I`, `O`, `0`).
//! Validation of typed codes is looser than generation: any 5 alphanumeric
//! characters are accepted case-insensitively, so codes shared over voice or
//! chat stay joinable regardless of who minted them.

use std::collections::HashMap;
use std::time::SystemTime;

use rand::Rng;

/// Length of every room code.
pub const CODE_LEN: usize = 5;

/// Generation alphabet: uppercase letters and digits minus `I`, `O`, `0`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ123456789";

/// Collision retry bound for code generation.
const MAX_CODE_ATTEMPTS: usize = 32;

/// A validated room code, canonically uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and canonicalize a room code. Case-insensitive.
    pub fn parse(code: &str) -> Result<Self, RoomIdError> {
        let trimmed = code.trim();
        if trimmed.len() != CODE_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RoomIdError::Invalid(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Generate a random code from the restricted alphabet.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rejected room code.
#[derive(Debug, Clone)]
pub enum RoomIdError {
    Invalid(String),
}

impl std::fmt::Display for RoomIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(code) => {
                write!(f, "room code {code:?} is not {CODE_LEN} alphanumeric characters")
            }
        }
    }
}

impl std::error::Error for RoomIdError {}

/// Registry errors.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// No free code found within the retry bound.
    Capacity,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capacity => write!(
                f,
                "no free room code after {MAX_CODE_ATTEMPTS} attempts"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Producer-side bookkeeping for one active room.
#[derive(Debug, Clone)]
pub struct RoomMeta {
    pub created_at: SystemTime,
}

/// Tracks the set of active rooms owned by this producer.
///
/// Codes are unique among active rooms; a closed room's code may be handed
/// out again by a later [`RoomRegistry::create_room`].
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, RoomMeta>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new room under a freshly generated code.
    pub fn create_room(&mut self) -> Result<RoomId, RegistryError> {
        self.create_room_with(RoomId::generate)
    }

    /// Register a new room using the supplied code generator (for testing).
    pub fn create_room_with(
        &mut self,
        mut generate: impl FnMut() -> RoomId,
    ) -> Result<RoomId, RegistryError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let id = generate();
            if self.rooms.contains_key(&id) {
                continue;
            }
            self.rooms.insert(
                id.clone(),
                RoomMeta {
                    created_at: SystemTime::now(),
                },
            );
            return Ok(id);
        }
        Err(RegistryError::Capacity)
    }

    /// Remove a room. Idempotent: unknown or already-closed ids are a no-op.
    pub fn close_room(&mut self, id: &RoomId) -> bool {
        self.rooms.remove(id).is_some()
    }

    pub fn is_active(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes() {
        let id = RoomId::parse("a1b2c").unwrap();
        assert_eq!(id.as_str(), "A1B2C");
        assert_eq!(id, RoomId::parse("A1B2C").unwrap());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        assert_eq!(RoomId::parse(" A1B2C ").unwrap().as_str(), "A1B2C");
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("ABCD").is_err());
        assert!(RoomId::parse("ABCDEF").is_err());
        assert!(RoomId::parse("AB CD").is_err());
        assert!(RoomId::parse("AB-CD").is_err());
    }

    #[test]
    fn test_generated_codes_use_restricted_alphabet() {
        for _ in 0..200 {
            let id = RoomId::generate();
            assert_eq!(id.as_str().len(), CODE_LEN);
            for b in id.as_str().bytes() {
                assert!(
                    CODE_ALPHABET.contains(&b),
                    "unexpected code character {:?}",
                    b as char
                );
            }
        }
    }

    #[test]
    fn test_create_room_codes_distinct_while_open() {
        let mut registry = RoomRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = registry.create_room().unwrap();
            assert!(seen.insert(id), "registry handed out a duplicate live code");
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_close_room_idempotent() {
        let mut registry = RoomRegistry::new();
        let id = registry.create_room().unwrap();

        assert!(registry.close_room(&id));
        assert!(!registry.close_room(&id));
        assert!(!registry.close_room(&RoomId::parse("ZZZZZ").unwrap()));
        assert!(!registry.is_active(&id));
    }

    #[test]
    fn test_code_reuse_after_close() {
        let mut registry = RoomRegistry::new();
        let fixed = RoomId::parse("A1B2C").unwrap();

        let first = registry
            .create_room_with(|| fixed.clone())
            .unwrap();
        assert_eq!(first, fixed);

        registry.close_room(&fixed);

        // The code is free again once the room is closed.
        let second = registry.create_room_with(|| fixed.clone()).unwrap();
        assert_eq!(second, fixed);
    }

    #[test]
    fn test_capacity_error_when_generator_exhausted() {
        let mut registry = RoomRegistry::new();
        let fixed = RoomId::parse("A1B2C").unwrap();

        registry.create_room_with(|| fixed.clone()).unwrap();
        let err = registry.create_room_with(|| fixed.clone());
        assert!(matches!(err, Err(RegistryError::Capacity)));

        // The failed attempt must not have registered anything new.
        assert_eq!(registry.len(), 1);
    }
}
