use regex::Regex;

use crate::Error;

/// A secret detection rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: &'static str,
    pub description: &'static str,
    regex: Regex,
    /// Cheap substrings one of which must be present before the regex runs.
    keywords: &'static [&'static str],
    /// Marks the opening line of a block that ends at a line containing this text.
    block_end: Option<&'static str>,
}

impl Rule {
    pub fn new(
        id: &'static str,
        description: &'static str,
        pattern: &str,
        keywords: &'static [&'static str],
    ) -> Result<Self, Error> {
        let regex = Regex::new(pattern).map_err(|e| Error::Bug(format!("secret rule {id}: {e}")))?;
        Ok(Rule {
            id,
            description,
            regex,
            keywords,
            block_end: None,
        })
    }

    fn ending_block_at(mut self, end: &'static str) -> Self {
        self.block_end = Some(end);
        self
    }

    /// The text that closes a block opened by this rule's match, if it spans lines.
    pub fn block_end(&self) -> Option<&'static str> {
        self.block_end
    }

    /// The secret in `line`: the first capture group if the pattern has one, else the whole match.
    pub fn find<'a>(&self, line: &'a str) -> Option<&'a str> {
        if !self.keywords.is_empty() && !self.keywords.iter().any(|k| line.contains(k)) {
            return None;
        }
        let caps = self.regex.captures(line)?;
        caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str())
    }
}

/// The rules a scan applies, in reporting order.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleSet { rules }
    }

    /// Detectors for widely leaked credential formats.
    pub fn builtin() -> Result<Self, Error> {
        Ok(RuleSet::new(vec![
            Rule::new(
                "aws-access-token",
                "AWS access key ID",
                r"\b((?:A3T[A-Z0-9]|AKIA|ASIA|ABIA|ACCA)[A-Z0-9]{16})\b",
                &["A3T", "AKIA", "ASIA", "ABIA", "ACCA"],
            )?,
            Rule::new(
                "github-pat",
                "GitHub personal access token",
                r"\b(ghp_[0-9a-zA-Z]{36})\b",
                &["ghp_"],
            )?,
            Rule::new(
                "github-fine-grained-pat",
                "GitHub fine-grained personal access token",
                r"\b(github_pat_[0-9a-zA-Z_]{82})\b",
                &["github_pat_"],
            )?,
            Rule::new(
                "github-oauth",
                "GitHub OAuth access token",
                r"\b(gho_[0-9a-zA-Z]{36})\b",
                &["gho_"],
            )?,
            Rule::new(
                "github-app-token",
                "GitHub app token",
                r"\b((?:ghu|ghs)_[0-9a-zA-Z]{36})\b",
                &["ghu_", "ghs_"],
            )?,
            Rule::new(
                "gitlab-pat",
                "GitLab personal access token",
                r"\b(glpat-[0-9a-zA-Z_\-]{20})\b",
                &["glpat-"],
            )?,
            Rule::new(
                "slack-bot-token",
                "Slack bot token",
                r"(xoxb-[0-9]{10,13}-[0-9]{10,13}[a-zA-Z0-9-]*)",
                &["xoxb-"],
            )?,
            Rule::new(
                "slack-user-token",
                "Slack user token",
                r"(xox[pe](?:-[0-9]{10,13}){3}-[a-zA-Z0-9-]{28,34})",
                &["xoxp-", "xoxe-"],
            )?,
            Rule::new(
                "stripe-access-token",
                "Stripe secret or restricted key",
                r"\b((?:sk|rk)_(?:test|live|prod)_[a-zA-Z0-9]{10,99})\b",
                &["sk_", "rk_"],
            )?,
            Rule::new(
                "gcp-api-key",
                "Google Cloud API key",
                r"\b(AIza[0-9A-Za-z_\-]{35})\b",
                &["AIza"],
            )?,
            Rule::new(
                "npm-access-token",
                "npm access token",
                r"\b(npm_[a-zA-Z0-9]{36})\b",
                &["npm_"],
            )?,
            Rule::new(
                "jwt",
                "JSON web token",
                r"\b(ey[a-zA-Z0-9]{17,}\.ey[a-zA-Z0-9/\\_-]{17,}\.(?:[a-zA-Z0-9/\\_-]{10,}={0,2})?)",
                &["ey"],
            )?,
            Rule::new(
                "private-key",
                "Private key",
                r"(-----BEGIN[ A-Z0-9_-]{0,100}PRIVATE KEY(?: BLOCK)?-----)",
                &["-----BEGIN"],
            )?
            .ending_block_at("-----END"),
        ]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}
