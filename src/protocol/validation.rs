/// Maximum accepted room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 64;
/// Maximum accepted player display name length.
pub const MAX_PLAYER_NAME_LENGTH: usize = 32;

pub fn validate_room_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Room name cannot be empty".to_string());
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err(format!(
            "Room name too long (max {MAX_ROOM_NAME_LENGTH} characters)"
        ));
    }
    Ok(())
}

pub fn validate_player_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Player name cannot be empty".to_string());
    }
    if name.len() > MAX_PLAYER_NAME_LENGTH {
        return Err(format!(
            "Player name too long (max {MAX_PLAYER_NAME_LENGTH} characters)"
        ));
    }
    if name.chars().any(char::is_control) {
        return Err("Player name contains invalid characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_names() {
        assert!(validate_player_name("   ").is_err());
        assert!(validate_room_name("").is_err());
    }

    #[test]
    fn rejects_oversized_names() {
        assert!(validate_player_name(&"x".repeat(33)).is_err());
        assert!(validate_room_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn accepts_ordinary_names() {
        assert!(validate_player_name("alice").is_ok());
        assert!(validate_room_name("Friday Night Race").is_ok());
    }
}
