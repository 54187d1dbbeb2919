use crate::profile::Profile;

/// Builds the canonical embedding input for a profile. Field order is fixed
/// so the string doubles as the cache key for embedding invalidation: any
/// preference change produces a different string.
pub fn build_embedding_text(profile: &Profile) -> String {
    [
        format!("Profession: {}", profile.profession.trim()),
        format!("About me: {}", profile.about_me.trim()),
        format!("Interests: {}", join_trimmed(&profile.interests)),
        format!("Languages: {}", join_trimmed(&profile.languages)),
    ]
    .join("\n")
}

fn join_trimmed(items: &[String]) -> String {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile() -> Profile {
        Profile {
            user_id: "u1".to_string(),
            display_name: String::new(),
            profession: " Software Engineer ".to_string(),
            about_me: "I like quiet mornings".to_string(),
            interests: vec!["chess".to_string(), " hiking ".to_string()],
            languages: vec!["English".to_string(), "Spanish".to_string()],
            commute_window: None,
            commute_days: Vec::new(),
            embedding_text: String::new(),
            embedding: None,
            embedding_version: String::new(),
        }
    }

    #[test]
    fn serializes_labeled_lines_in_fixed_order() {
        assert_eq!(
            build_embedding_text(&profile()),
            "Profession: Software Engineer\n\
             About me: I like quiet mornings\n\
             Interests: chess, hiking\n\
             Languages: English, Spanish"
        );
    }

    #[test]
    fn empty_fields_keep_their_labels() {
        let mut p = profile();
        p.profession.clear();
        p.interests.clear();
        let text = build_embedding_text(&p);
        assert!(text.starts_with("Profession: \n"));
        assert!(text.contains("Interests: \n"));
    }

    #[test]
    fn is_deterministic() {
        let p = profile();
        assert_eq!(build_embedding_text(&p), build_embedding_text(&p));
    }

    #[test]
    fn any_field_change_changes_the_text() {
        let base = build_embedding_text(&profile());
        let mut p = profile();
        p.interests.push("cycling".to_string());
        assert_ne!(base, build_embedding_text(&p));
    }
}
