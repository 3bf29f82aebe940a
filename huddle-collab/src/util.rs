use rand::{distributions::Alphanumeric, thread_rng, Rng};

pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// Turns a room name into a url-safe slug with a random suffix, e.g. `daily-standup-x7k2`
pub fn room_slug(name: &str) -> String {
    let base: Vec<_> = name
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let suffix = random_string(4).to_lowercase();

    if base.is_empty() {
        suffix
    } else {
        format!("{}-{}", base.join("-"), suffix)
    }
}

#[cfg(test)]
mod test {
    use super::room_slug;

    #[test]
    fn slugs_are_url_safe() {
        let slug = room_slug("Daily  Standup!");

        assert!(slug.starts_with("daily-standup-"));
        assert_eq!(slug.len(), "daily-standup-".len() + 4);
        assert!(slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(slug.chars().all(|c| !c.is_ascii_uppercase()));

        assert_eq!(room_slug("¡¡").len(), 4);
    }
}
