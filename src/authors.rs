use crate::FHashMap;

/// Maps svn usernames to Git author identities, loaded from the file given
/// with `--authors`. One entry per line: `user = Author Name <email>`.
pub struct AuthorMap {
    map: FHashMap<Vec<u8>, AuthorEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct AuthorEntry {
    name: String,
    email: String,
}

pub enum AuthorMapParseError {
    Io(std::io::Error),
    BadLine(usize, Vec<u8>),
}

impl From<std::io::Error> for AuthorMapParseError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::fmt::Display for AuthorMapParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => e.fmt(f),
            Self::BadLine(line, ref line_data) => {
                write!(f, "bad line {}: \"{}\"", line + 1, line_data.escape_ascii())
            }
        }
    }
}

impl AuthorMap {
    pub fn new() -> Self {
        Self {
            map: FHashMap::default(),
        }
    }

    pub fn parse(src: &mut dyn std::io::BufRead) -> Result<Self, AuthorMapParseError> {
        let mut map = FHashMap::default();

        let mut line_i = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            src.read_until(b'\n', &mut line)?;

            match parse_line(&line) {
                Some(Some((user, entry))) => {
                    map.insert(user, entry);
                }
                Some(None) => {}
                None => return Err(AuthorMapParseError::BadLine(line_i, line)),
            }

            if !line.ends_with(b"\n") {
                break;
            }

            line_i += 1;
        }

        Ok(Self { map })
    }

    /// Committer line for a revision, without the timestamp part. Unmapped
    /// users fall back to `user <user@uuid>` so the identity stays stable
    /// across runs.
    pub fn committer(&self, svn_author: Option<&[u8]>, uuid: Option<&uuid::Uuid>) -> String {
        let Some(svn_author) = svn_author.filter(|a| !a.is_empty()) else {
            return "nobody <nobody@localhost>".into();
        };

        if let Some(entry) = self.map.get(svn_author) {
            format!("{} <{}>", entry.name, entry.email)
        } else {
            let user = String::from_utf8_lossy(svn_author);
            let domain = uuid.map_or_else(|| "localhost".into(), ToString::to_string);
            format!("{user} <{user}@{domain}>")
        }
    }
}

impl Default for AuthorMap {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &[u8]) -> Option<Option<(Vec<u8>, AuthorEntry)>> {
    let mut rem = line;
    rem = rem.strip_suffix(b"\n").unwrap_or(rem);
    rem = rem.strip_suffix(b"\r").unwrap_or(rem);
    skip_spaces(&mut rem);

    if rem.is_empty() || rem.starts_with(b"#") {
        return Some(None);
    }

    let user_len = rem
        .iter()
        .position(|&b| matches!(b, b' ' | b'\t' | b'='))
        .filter(|&l| l != 0)?;

    let user = rem[..user_len].to_vec();
    rem = &rem[user_len..];

    skip_spaces(&mut rem);
    rem = rem.strip_prefix(b"=")?;

    let name_len = rem.iter().position(|&b| b == b'<')?;
    let name = String::from(std::str::from_utf8(&rem[..name_len]).ok()?.trim());
    rem = &rem[name_len..];

    rem = rem.strip_prefix(b"<").unwrap();
    let email_len = rem.iter().position(|&b| b == b'>')?;
    let email = String::from(std::str::from_utf8(&rem[..email_len]).ok()?);
    rem = &rem[email_len..];

    rem = rem.strip_prefix(b">").unwrap();
    if !rem.iter().all(|&b| matches!(b, b' ' | b'\t')) {
        return None;
    }

    Some(Some((user, AuthorEntry { name, email })))
}

fn skip_spaces(slice: &mut &[u8]) {
    while let Some(rem) = slice
        .strip_prefix(b" ")
        .or_else(|| slice.strip_prefix(b"\t"))
    {
        *slice = rem;
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_line, AuthorEntry, AuthorMap};

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line(b" user = User Name <user@email> "),
            Some(Some((
                b"user".to_vec(),
                AuthorEntry {
                    name: "User Name".into(),
                    email: "user@email".into(),
                }
            ))),
        );
        assert_eq!(
            parse_line(b"user=User Name<user@email>"),
            Some(Some((
                b"user".to_vec(),
                AuthorEntry {
                    name: "User Name".into(),
                    email: "user@email".into(),
                }
            ))),
        );
        assert_eq!(parse_line(b""), Some(None));
        assert_eq!(parse_line(b"# a comment\n"), Some(None));
        assert_eq!(parse_line(b"user = broken"), None);
    }

    #[test]
    fn test_committer_fallbacks() {
        let mut src = &b"jdoe = John Doe <jdoe@example.org>\n"[..];
        let map = AuthorMap::parse(&mut src).ok().unwrap();

        assert_eq!(
            map.committer(Some(b"jdoe"), None),
            "John Doe <jdoe@example.org>",
        );
        let uuid = uuid::Uuid::parse_str("c585f4f6-4a4e-0310-87e4-dc9351c65849").unwrap();
        assert_eq!(
            map.committer(Some(b"other"), Some(&uuid)),
            "other <other@c585f4f6-4a4e-0310-87e4-dc9351c65849>",
        );
        assert_eq!(map.committer(None, None), "nobody <nobody@localhost>");
    }
}
