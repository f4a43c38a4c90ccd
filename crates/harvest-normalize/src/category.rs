use std::collections::BTreeMap;

pub const UNCATEGORIZED: &str = "Uncategorized";

/// Shared keyword table. Matching is by substring and the first entry in
/// declaration order wins, so "trivia night" lands in Community before Nightlife
/// ever gets a look.
pub const DEFAULT_CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("concert", "Music"),
    ("music", "Music"),
    ("jazz", "Music"),
    ("dj", "Music"),
    ("symphony", "Music"),
    ("comedy", "Comedy"),
    ("stand-up", "Comedy"),
    ("improv", "Comedy"),
    ("trivia", "Community"),
    ("market", "Community"),
    ("festival", "Community"),
    ("fair", "Community"),
    ("volunteer", "Community"),
    ("food", "Food & Drink"),
    ("wine", "Food & Drink"),
    ("beer", "Food & Drink"),
    ("tasting", "Food & Drink"),
    ("brunch", "Food & Drink"),
    ("theater", "Arts & Culture"),
    ("theatre", "Arts & Culture"),
    ("museum", "Arts & Culture"),
    ("gallery", "Arts & Culture"),
    ("exhibit", "Arts & Culture"),
    ("art", "Arts & Culture"),
    ("film", "Film"),
    ("movie", "Film"),
    ("kids", "Family"),
    ("family", "Family"),
    ("children", "Family"),
    ("hike", "Outdoors"),
    ("outdoor", "Outdoors"),
    ("park", "Outdoors"),
    ("sports", "Sports & Fitness"),
    ("fitness", "Sports & Fitness"),
    ("yoga", "Sports & Fitness"),
    ("run", "Sports & Fitness"),
    ("night", "Nightlife"),
    ("club", "Nightlife"),
    ("party", "Nightlife"),
];

/// Per-source exact table first, then the shared keyword table, else the text itself.
pub fn map_category(text: &str, mapping: Option<&BTreeMap<String, String>>) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return UNCATEGORIZED.to_string();
    }
    let lower = trimmed.to_lowercase();

    if let Some(mapping) = mapping {
        if let Some(category) = mapping
            .iter()
            .find(|(key, _)| key.trim().to_lowercase() == lower)
            .map(|(_, v)| v)
        {
            return category.clone();
        }
    }

    DEFAULT_CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| (*category).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_table_wins_with_case_insensitive_exact_key() {
        let mut mapping = BTreeMap::new();
        mapping.insert("live shows".to_string(), "Music".to_string());
        assert_eq!(map_category("Live Shows", Some(&mapping)), "Music");
        // Substrings of a source key do not match the source table.
        assert_eq!(map_category("Live", Some(&mapping)), "Live");
    }

    #[test]
    fn default_table_is_first_substring_match_in_declaration_order() {
        assert_eq!(map_category("Jazz Brunch", None), "Music");
        assert_eq!(map_category("Trivia Night", None), "Community");
        assert_eq!(map_category("Night Market", None), "Community");
        // "party" contains "art", which is declared earlier.
        assert_eq!(map_category("Dance Party", None), "Arts & Culture");
    }

    #[test]
    fn unknown_text_passes_through_and_empty_is_uncategorized() {
        assert_eq!(map_category("  Workshops ", None), "Workshops");
        assert_eq!(map_category("", None), UNCATEGORIZED);
    }
}
