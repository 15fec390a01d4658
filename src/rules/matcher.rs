use crate::FHashMap;

/// One flattened mapping entry: an svn prefix plus a revision window on the
/// left, a `(repository, ref, git path)` target on the right.
pub struct MatchRule {
    pub svn_prefix: Vec<u8>,
    /// Byte length of the branch-owning part of `svn_prefix`; when the whole
    /// prefix is the branch part, a path equal to the prefix names the
    /// branch root itself.
    pub branch_prefix_len: usize,
    pub min_rev: u32,
    pub max_rev: u32,
    pub repo: String,
    pub ref_name: String,
    pub is_tag: bool,
    pub git_path: Vec<u8>,
    pub decl_order: usize,
}

struct Node {
    children: FHashMap<Vec<u8>, usize>,
    /// Indices of rules whose svn prefix ends at this node.
    rules: Vec<usize>,
}

/// Longest-prefix matcher over svn paths. Rules live in a trie keyed by
/// path components; the deepest node holding a rule whose revision window
/// contains the queried revision wins, with declaration order breaking
/// ties.
pub struct RuleMatcher {
    nodes: Vec<Node>,
    rules: Vec<MatchRule>,
}

pub struct Builder {
    matcher: RuleMatcher,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            matcher: RuleMatcher {
                nodes: vec![Node {
                    children: FHashMap::default(),
                    rules: Vec::new(),
                }],
                rules: Vec::new(),
            },
        }
    }

    pub fn add(&mut self, mut rule: MatchRule) {
        let rule_i = self.matcher.rules.len();
        rule.decl_order = rule_i;

        let mut node_i = 0;
        if !rule.svn_prefix.is_empty() {
            for component in rule.svn_prefix.split(|&c| c == b'/') {
                node_i = match self.matcher.nodes[node_i].children.get(component) {
                    Some(&child_i) => child_i,
                    None => {
                        let child_i = self.matcher.nodes.len();
                        self.matcher.nodes.push(Node {
                            children: FHashMap::default(),
                            rules: Vec::new(),
                        });
                        self.matcher.nodes[node_i]
                            .children
                            .insert(component.to_vec(), child_i);
                        child_i
                    }
                };
            }
        }

        self.matcher.nodes[node_i].rules.push(rule_i);
        self.matcher.rules.push(rule);
    }

    pub fn finish(self) -> RuleMatcher {
        self.matcher
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MatchResult<'a> {
    pub rule: &'a MatchRule,
    /// Index of the matched rule, for coverage accounting.
    pub rule_index: usize,
    path: &'a [u8],
    prefix_len: usize,
}

impl MatchResult<'_> {
    /// Remainder of the queried path after the matched prefix, without a
    /// leading slash.
    pub fn svn_suffix(&self) -> &[u8] {
        if self.prefix_len == self.path.len() {
            b""
        } else if self.prefix_len == 0 {
            self.path
        } else {
            &self.path[(self.prefix_len + 1)..]
        }
    }

    /// Destination path inside the target repository.
    pub fn git_path(&self) -> Vec<u8> {
        join_paths(&self.rule.git_path, self.svn_suffix())
    }

    /// True when the queried path names the branch root itself (an svn copy
    /// or deletion of it is a branch-level operation, not a file one).
    pub fn is_branch_root(&self) -> bool {
        self.svn_suffix().is_empty()
            && self.rule.branch_prefix_len == self.rule.svn_prefix.len()
    }

    /// The svn directory owning the matched branch.
    pub fn branch_svn_path(&self) -> &[u8] {
        &self.rule.svn_prefix[..self.rule.branch_prefix_len]
    }
}

pub(crate) fn join_paths(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    if prefix.is_empty() {
        suffix.to_vec()
    } else if suffix.is_empty() {
        prefix.to_vec()
    } else {
        let mut joined = Vec::with_capacity(prefix.len() + 1 + suffix.len());
        joined.extend_from_slice(prefix);
        joined.push(b'/');
        joined.extend_from_slice(suffix);
        joined
    }
}

impl RuleMatcher {
    pub fn longest_match<'a>(&'a self, path: &'a [u8], rev: u32) -> Option<MatchResult<'a>> {
        // Walk as deep as the trie allows, then search candidate nodes from
        // the deepest up.
        let mut visited = vec![(0usize, 0usize)];
        if !path.is_empty() {
            let mut node_i = 0;
            let mut consumed = 0;
            for component in path.split(|&c| c == b'/') {
                let Some(&child_i) = self.nodes[node_i].children.get(component) else {
                    break;
                };
                if consumed != 0 {
                    consumed += 1; // the '/'
                }
                consumed += component.len();
                node_i = child_i;
                visited.push((node_i, consumed));
            }
        }

        for &(node_i, prefix_len) in visited.iter().rev() {
            let best = self.nodes[node_i]
                .rules
                .iter()
                .copied()
                .filter(|&rule_i| {
                    let rule = &self.rules[rule_i];
                    rule.min_rev <= rev && rev <= rule.max_rev
                })
                .min_by_key(|&rule_i| self.rules[rule_i].decl_order);
            if let Some(rule_i) = best {
                return Some(MatchResult {
                    rule: &self.rules[rule_i],
                    rule_index: rule_i,
                    path,
                    prefix_len,
                });
            }
        }

        None
    }

    #[inline]
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    #[inline]
    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    fn dump_node(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        node_i: usize,
        prefix: &mut String,
    ) -> std::fmt::Result {
        let node = &self.nodes[node_i];

        for &rule_i in node.rules.iter() {
            let rule = &self.rules[rule_i];
            write!(
                f,
                "{}/ -> {} {} /{}",
                prefix,
                rule.repo,
                rule.ref_name,
                String::from_utf8_lossy(&rule.git_path),
            )?;
            if rule.min_rev != 0 || rule.max_rev != u32::MAX {
                write!(f, " [r{}:r{}]", rule.min_rev, rule.max_rev)?;
            }
            writeln!(f, " (#{})", rule.decl_order)?;
        }

        let mut children: Vec<_> = node.children.iter().collect();
        children.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (component, &child_i) in children {
            let prev_len = prefix.len();
            prefix.push('/');
            prefix.push_str(&String::from_utf8_lossy(component));
            self.dump_node(f, child_i, prefix)?;
            prefix.truncate(prev_len);
        }

        Ok(())
    }
}

impl std::fmt::Display for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut prefix = String::new();
        self.dump_node(f, 0, &mut prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::{Builder, MatchRule};

    fn rule(prefix: &str, branch_len: usize, min: u32, max: u32, ref_name: &str) -> MatchRule {
        MatchRule {
            svn_prefix: prefix.as_bytes().to_vec(),
            branch_prefix_len: branch_len,
            min_rev: min,
            max_rev: max,
            repo: "repo".into(),
            ref_name: ref_name.into(),
            is_tag: false,
            git_path: Vec::new(),
            decl_order: 0,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut builder = Builder::new();
        builder.add(rule("trunk", 5, 0, u32::MAX, "refs/heads/master"));
        builder.add(rule("trunk/sub", 9, 0, u32::MAX, "refs/heads/sub"));
        let matcher = builder.finish();

        let m = matcher.longest_match(b"trunk/sub/f.c", 1).unwrap();
        assert_eq!(m.rule.ref_name, "refs/heads/sub");
        assert_eq!(m.svn_suffix(), b"f.c");

        let m = matcher.longest_match(b"trunk/other/f.c", 1).unwrap();
        assert_eq!(m.rule.ref_name, "refs/heads/master");
        assert_eq!(m.svn_suffix(), b"other/f.c");

        assert!(matcher.longest_match(b"unrelated/f.c", 1).is_none());
    }

    #[test]
    fn test_revision_window_fallback() {
        let mut builder = Builder::new();
        builder.add(rule("trunk", 5, 0, u32::MAX, "refs/heads/master"));
        builder.add(rule("trunk/sub", 9, 100, 200, "refs/heads/sub"));
        let matcher = builder.finish();

        // Out of the window of the deeper rule, the shallower one applies.
        let m = matcher.longest_match(b"trunk/sub/f.c", 50).unwrap();
        assert_eq!(m.rule.ref_name, "refs/heads/master");
        let m = matcher.longest_match(b"trunk/sub/f.c", 150).unwrap();
        assert_eq!(m.rule.ref_name, "refs/heads/sub");
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let mut builder = Builder::new();
        builder.add(rule("trunk", 5, 0, u32::MAX, "refs/heads/first"));
        builder.add(rule("trunk", 5, 0, u32::MAX, "refs/heads/second"));
        let matcher = builder.finish();

        let m = matcher.longest_match(b"trunk/f.c", 1).unwrap();
        assert_eq!(m.rule.ref_name, "refs/heads/first");
    }

    #[test]
    fn test_branch_root_detection() {
        let mut builder = Builder::new();
        builder.add(rule("branches/b", 10, 0, u32::MAX, "refs/heads/b"));
        let matcher = builder.finish();

        assert!(matcher.longest_match(b"branches/b", 1).unwrap().is_branch_root());
        assert!(!matcher.longest_match(b"branches/b/f", 1).unwrap().is_branch_root());
    }

    #[test]
    fn test_dump_is_stable() {
        let mut builder = Builder::new();
        builder.add(rule("trunk", 5, 0, u32::MAX, "refs/heads/master"));
        builder.add(rule("branches/b", 10, 2, 7, "refs/heads/b"));
        let matcher = builder.finish();

        let first = matcher.to_string();
        let second = matcher.to_string();
        assert_eq!(first, second);
        assert!(first.contains("/trunk/ -> repo refs/heads/master"));
        assert!(first.contains("[r2:r7]"));
    }
}
