use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

/// Generates a random alphanumeric string of length `n`.
///
/// `thread_rng` is a CSPRNG, so this is also used for generated passwords
/// and for OpenID state/nonce values.
pub fn generate_random_string(n: usize) -> String {
    let rng = rand::thread_rng();
    rng.sample_iter(&Alphanumeric)
        .map(char::from)
        .take(n)
        .collect()
}

/// Builds a unique identifier used to name a launched instance and its
/// SSH key pair.
pub fn generate_run_identifier() -> String {
    format!("tortuga-test-lib-{}", Uuid::new_v4())
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_random_string_length_and_alphabet() {
        let value = generate_random_string(32);

        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_run_identifier_is_unique() {
        let first = generate_run_identifier();
        let second = generate_run_identifier();

        assert!(first.starts_with("tortuga-test-lib-"));
        assert_ne!(first, second);
    }
}
