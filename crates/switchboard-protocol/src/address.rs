//! Address syntax for the exchange.
//!
//! Addresses are email-shaped, case-sensitive identifiers:
//! `local@domain.tld`, 1-255 characters, no whitespace anywhere, exactly
//! one `@`, and a dot inside the domain with characters on both sides.

/// Maximum address length.
pub const MAX_ADDRESS_LENGTH: usize = 255;

/// Validate an address.
///
/// # Errors
///
/// Returns a static message describing the first rule violated.
pub fn validate_address(address: &str) -> Result<(), &'static str> {
    if address.is_empty() {
        return Err("address cannot be empty");
    }
    if address.len() > MAX_ADDRESS_LENGTH {
        return Err("address too long");
    }
    if address.chars().any(char::is_whitespace) {
        return Err("address cannot contain whitespace");
    }

    let Some((local, domain)) = address.split_once('@') else {
        return Err("address must contain '@'");
    };
    if local.is_empty() {
        return Err("address local part cannot be empty");
    }
    if domain.is_empty() || domain.contains('@') {
        return Err("address must contain exactly one '@'");
    }

    let Some((host, tld)) = domain.rsplit_once('.') else {
        return Err("address domain must contain '.'");
    };
    if host.is_empty() || tld.is_empty() {
        return Err("address domain must have characters around '.'");
    }

    Ok(())
}

/// The part after `@`, if the address has one.
#[must_use]
pub fn address_domain(address: &str) -> Option<&str> {
    address.split_once('@').map(|(_, domain)| domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(validate_address("a@x.y").is_ok());
        assert!(validate_address("agent.42@sub.example.com").is_ok());
        assert!(validate_address("UPPER@Case.Ok").is_ok());
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(validate_address("").is_err());
        assert!(validate_address("no-at-sign").is_err());
        assert!(validate_address("a@nodot").is_err());
        assert!(validate_address("a@.y").is_err());
        assert!(validate_address("a@x.").is_err());
        assert!(validate_address("@x.y").is_err());
        assert!(validate_address("a b@x.y").is_err());
        assert!(validate_address("a@x@y.z").is_err());
    }

    #[test]
    fn test_length_limit() {
        let local = "a".repeat(MAX_ADDRESS_LENGTH);
        assert!(validate_address(&format!("{local}@x.y")).is_err());

        let max_local = "a".repeat(MAX_ADDRESS_LENGTH - 4);
        assert!(validate_address(&format!("{max_local}@x.y")).is_ok());
    }

    #[test]
    fn test_address_domain() {
        assert_eq!(address_domain("a@x.y"), Some("x.y"));
        assert_eq!(address_domain("nodomain"), None);
    }
}
