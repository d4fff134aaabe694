/// Minimal robots.txt evaluation: collect `Disallow:` rules from every
/// `User-agent` section that applies to us, then prefix-match paths.
///
/// A section applies when its agent is `*` or is a substring of our own
/// user agent (case-insensitive). More elaborate directives (Allow,
/// Crawl-delay, wildcards) are deliberately ignored.
#[derive(Debug, Default, Clone)]
pub struct RobotsPolicy {
    disallowed: Vec<String>,
}

impl RobotsPolicy {
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let user_agent = user_agent.to_lowercase();
        let mut disallowed = Vec::new();
        let mut section_applies = false;

        for line in content.lines() {
            let line = line.trim().to_lowercase();

            if let Some(agent) = line.strip_prefix("user-agent:") {
                let agent = agent.trim();
                section_applies = agent == "*" || user_agent.contains(agent);
            } else if section_applies {
                if let Some(path) = line.strip_prefix("disallow:") {
                    let path = path.trim();
                    if !path.is_empty() {
                        disallowed.push(path.to_string());
                    }
                }
            }
        }

        Self { disallowed }
    }

    /// Policy that permits everything. Used when robots.txt is missing or
    /// unreadable.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        !self
            .disallowed
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}
