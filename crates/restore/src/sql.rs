//! SQL text helpers: splitting dump files into `;`-terminated statements and
//! deferring secondary keys out of CREATE TABLE.
//!
//! The splitter operates on bytes so chunked reads never tear multi-byte
//! characters; statement text is recovered lossily at emit time (dump
//! producers escape binary payloads, so real dumps are valid UTF-8).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment,
}

/// Incremental statement splitter. Feed arbitrary chunks; complete
/// statements are appended to `out` as they close.
pub struct StatementSplitter {
    state: SplitState,
    pending: Vec<u8>,
    /// Previous byte, for `--` and `/*` / `*/` detection across chunks.
    previous: u8,
    /// Set when the previous byte was an unconsumed backslash escape.
    escaped: bool,
}

impl StatementSplitter {
    pub fn new() -> Self {
        Self {
            state: SplitState::Normal,
            pending: Vec::new(),
            previous: 0,
            escaped: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        for &byte in chunk {
            self.pending.push(byte);
            let previous = self.previous;
            self.previous = byte;

            if self.escaped {
                self.escaped = false;
                continue;
            }

            match self.state {
                SplitState::Normal => match byte {
                    b';' => {
                        // `previous` is now stale for the next statement.
                        self.previous = 0;
                        if let Some(statement) = take_statement(&mut self.pending) {
                            out.push(statement);
                        }
                    },
                    b'\'' => self.state = SplitState::SingleQuote,
                    b'"' => self.state = SplitState::DoubleQuote,
                    b'`' => self.state = SplitState::Backtick,
                    b'#' => self.state = SplitState::LineComment,
                    b'-' if previous == b'-' => self.state = SplitState::LineComment,
                    b'*' if previous == b'/' => self.state = SplitState::BlockComment,
                    _ => {},
                },
                SplitState::SingleQuote => match byte {
                    b'\\' => self.escaped = true,
                    b'\'' => self.state = SplitState::Normal,
                    _ => {},
                },
                SplitState::DoubleQuote => match byte {
                    b'\\' => self.escaped = true,
                    b'"' => self.state = SplitState::Normal,
                    _ => {},
                },
                SplitState::Backtick => {
                    if byte == b'`' {
                        self.state = SplitState::Normal;
                    }
                },
                SplitState::LineComment => {
                    if byte == b'\n' {
                        self.state = SplitState::Normal;
                    }
                },
                SplitState::BlockComment => {
                    if byte == b'/' && previous == b'*' {
                        self.state = SplitState::Normal;
                    }
                },
            }
        }
    }

    /// Emit whatever trails the last semicolon, if it is executable.
    pub fn finish(&mut self) -> Option<String> {
        take_statement(&mut self.pending)
    }
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains the pending buffer into a statement, dropping the trailing
/// semicolon, leading comment lines, and surrounding whitespace. Returns
/// `None` when nothing executable remains.
fn take_statement(pending: &mut Vec<u8>) -> Option<String> {
    let raw = std::mem::take(pending);
    let text = String::from_utf8_lossy(&raw);
    let text = text.trim();
    let text = text.strip_suffix(';').unwrap_or(text);
    let mut start = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("--") || trimmed.starts_with('#') || trimmed.is_empty() {
            start += line.len();
        } else {
            break;
        }
    }
    let statement = text[start..].trim();
    if statement.is_empty() {
        return None;
    }
    Some(statement.to_owned())
}

/// Split secondary-key clauses out of a CREATE TABLE statement. Returns the
/// rewritten CREATE and a single ALTER adding the deferred keys, or `None`
/// when the statement has no deferrable keys. PRIMARY KEY, FOREIGN KEY, and
/// CONSTRAINT clauses are never deferred.
pub fn split_indexes(create: &str, qualified_table: &str) -> Option<(String, String)> {
    let mut kept = Vec::new();
    let mut deferred = Vec::new();
    for line in create.lines() {
        let trimmed = line.trim_start();
        if is_secondary_key_clause(trimmed) {
            deferred.push(trimmed.trim_end_matches(',').trim_end().to_owned());
        } else {
            kept.push(line.to_owned());
        }
    }
    if deferred.is_empty() {
        return None;
    }

    // The last column definition must not keep a trailing comma once the key
    // lines after it are gone.
    let closing = kept
        .iter()
        .position(|line| line.trim_start().starts_with(')'))?;
    if closing > 0 {
        let line = &mut kept[closing - 1];
        if let Some(stripped) = line.trim_end().strip_suffix(',') {
            *line = stripped.to_owned();
        }
    }

    let alter = format!(
        "ALTER TABLE {qualified_table} {}",
        deferred
            .iter()
            .map(|clause| format!("ADD {clause}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Some((kept.join("\n"), alter))
}

fn is_secondary_key_clause(trimmed: &str) -> bool {
    for prefix in [
        "KEY ",
        "KEY(",
        "KEY `",
        "UNIQUE KEY",
        "UNIQUE INDEX",
        "INDEX ",
        "INDEX `",
        "FULLTEXT KEY",
        "FULLTEXT INDEX",
        "SPATIAL KEY",
        "SPATIAL INDEX",
    ] {
        if trimmed.starts_with(prefix) {
            return true;
        }
    }
    false
}
