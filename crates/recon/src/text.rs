//! Word splitting and name similarity helpers.

use strsim::normalized_levenshtein;

/// Split on anything that is not ASCII alphanumeric, then on camel-case boundaries.
///
/// Digits stay attached to adjacent letters, so `37th` is one word.
pub fn split_words(value: &str) -> Vec<String> {
    value
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .flat_map(camel_case_split)
        .collect()
}

/// `MainStreet` → `Main`, `Street`; `HTTPServer` → `HTTP`, `Server`.
fn camel_case_split(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut words = Vec::new();
    let mut start = 0;
    for i in 1..chars.len() {
        let prev = chars[i - 1];
        let cur = chars[i];
        let lower_to_upper = prev.is_ascii_lowercase() && cur.is_ascii_uppercase();
        let acronym_end = prev.is_ascii_uppercase()
            && cur.is_ascii_uppercase()
            && chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
        if lower_to_upper || acronym_end {
            words.push(chars[start..i].iter().collect());
            start = i;
        }
    }
    words.push(chars[start..].iter().collect());
    words
}

/// Strip punctuation that varies between sources, leaving space-separated tokens.
pub fn clean_name(name: &str) -> String {
    let replaced = name
        .replace('\'', "")
        .replace(['-', ',', '.'], " ")
        .to_uppercase();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Token-order-insensitive similarity on a 0–100 scale.
///
/// Tokens are sorted and rejoined before an edit-distance ratio is taken,
/// so `SMITH JOHN` and `JOHN SMITH` score 100.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sort = |s: &str| {
        let mut tokens: Vec<String> = s.split_whitespace().map(str::to_uppercase).collect();
        tokens.sort();
        tokens.join(" ")
    };
    let (a, b) = (sort(a), sort(b));
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&a, &b) * 100.0
}

/// Number of distinct tokens the two cleaned names share.
pub fn shared_tokens(a: &str, b: &str) -> usize {
    let left: std::collections::BTreeSet<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    b.split(' ')
        .filter(|t| !t.is_empty())
        .collect::<std::collections::BTreeSet<&str>>()
        .intersection(&left)
        .count()
}

/// Canonical form for categorical values: trimmed, uppercased, inner whitespace collapsed.
pub fn normalize_category(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_punctuation_and_case() {
        assert_eq!(split_words("100 N. 37th St"), vec!["100", "N", "37th", "St"]);
        assert_eq!(split_words("MainStreet"), vec!["Main", "Street"]);
        assert_eq!(split_words("HTTPServer"), vec!["HTTP", "Server"]);
        assert!(split_words(" -- ").is_empty());
    }

    #[test]
    fn clean_name_strips_punctuation() {
        assert_eq!(clean_name("O'Brien-Smith, Jr."), "OBRIEN SMITH JR");
    }

    #[test]
    fn token_sort_ignores_order() {
        assert_eq!(token_sort_ratio("SMITH JOHN", "John Smith"), 100.0);
        assert!(token_sort_ratio("JOHN SMITH", "JON SMITH") >= 70.0);
        assert!(token_sort_ratio("JOHN SMITH", "MARIA GONZALEZ") < 70.0);
    }

    #[test]
    fn shared_token_count() {
        assert_eq!(shared_tokens("JOHN A SMITH", "SMITH JOHN"), 2);
        assert_eq!(shared_tokens("JOHN", "MARY"), 0);
    }

    #[test]
    fn categories_normalize() {
        assert_eq!(normalize_category("  hispanic /  latino "), "HISPANIC / LATINO");
    }
}
