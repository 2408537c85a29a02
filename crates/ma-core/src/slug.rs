//! Slug derivation for naming dependent entities

/// Convert a human name into an entity-id safe slug.
///
/// Lowercases, maps every run of non-alphanumeric characters to a single
/// underscore and trims underscores from both ends. Non-ASCII letters are
/// dropped rather than transliterated.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Living Room"), "living_room");
        assert_eq!(slugify("  Kid's -- Bedroom 2 "), "kid_s_bedroom_2");
        assert_eq!(slugify("kitchen"), "kitchen");
        assert_eq!(slugify("__"), "");
    }
}
