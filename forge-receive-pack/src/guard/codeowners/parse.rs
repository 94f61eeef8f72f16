use bstr::ByteSlice;

/// One `pattern owner...` line of a CODEOWNERS file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// 1-based.
    pub line_number: usize,
    pub pattern: String,
    pub owners: Vec<String>,
}

impl Entry {
    /// An entry without owners takes ownership away from earlier matching entries.
    pub fn is_ownership_reset(&self) -> bool {
        self.owners.is_empty()
    }

    /// Whether `path`, relative to the repository root, falls under this entry.
    ///
    /// Patterns follow gitignore conventions: a leading `/` anchors at the root, a trailing `/`
    /// matches everything below a directory and a pattern naming a directory covers its content.
    pub fn matches(&self, path: &str) -> bool {
        let mut pattern = self.pattern.clone();
        if pattern.ends_with('/') {
            pattern.push_str("**");
        }
        if !pattern.starts_with('/') {
            pattern.insert_str(0, "/**/");
        }
        let path = format!("/{path}");
        wildmatch(&pattern, &path) || wildmatch(&format!("{pattern}/**"), &path)
    }
}

fn wildmatch(pattern: &str, path: &str) -> bool {
    gix_glob::wildmatch(
        pattern.as_bytes().as_bstr(),
        path.as_bytes().as_bstr(),
        gix_glob::wildmatch::Mode::NO_MATCH_SLASH_LITERAL,
    )
}

/// A line that is not a valid entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid CODEOWNERS file at line {line_number} ({line}): {err}")]
pub struct ParseError {
    pub line_number: usize,
    pub line: String,
    pub err: String,
}

/// Parse CODEOWNERS `text` into its entries in file order.
///
/// Blank lines and `#` comments are skipped, a `#` after the pattern starts a trailing comment and
/// `\` escapes the next character of a pattern, which allows spaces in paths.
pub fn parse(text: &str) -> Result<Vec<Entry>, ParseError> {
    let mut entries = Vec::new();
    for (idx, original) in text.lines().enumerate() {
        let line_number = idx + 1;
        let line = original.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let error = |err: &str| ParseError {
            line_number,
            line: line.to_owned(),
            err: err.to_owned(),
        };

        let mut pattern = String::new();
        let mut chars = line.char_indices();
        let mut rest = "";
        while let Some((pos, c)) = chars.next() {
            match c {
                ' ' | '\t' => {
                    rest = &line[pos..];
                    break;
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => pattern.push(escaped),
                    None => return Err(error("a pattern can't end with an escape character ('\\')")),
                },
                c => pattern.push(c),
            }
        }
        let rest = rest.split_once('#').map_or(rest, |(owners, _comment)| owners);
        let owners: Vec<String> = rest.split_whitespace().map(ToOwned::to_owned).collect();
        if let Some(bad) = owners.iter().find(|o| !o.starts_with('@') && !o.contains('@')) {
            return Err(error(&format!("owner {bad:?} is neither an email address nor a group")));
        }
        entries.push(Entry {
            line_number,
            pattern,
            owners,
        });
    }
    Ok(entries)
}
