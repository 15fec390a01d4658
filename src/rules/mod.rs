use std::collections::HashMap;

use crate::errors::Fatal;
use crate::{FHashMap, FHashSet};

pub mod matcher;

pub use matcher::{MatchResult, RuleMatcher};

/// Raw ruleset file, as deserialized. Several `[[repository]]` tables may
/// share a name; each contributes rules for its own revision window, like
/// the multiset-of-repo-rules model of the original exporter.
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(rename = "repository", default = "Vec::new")]
    repositories: Vec<RepoRuleDef>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RepoRuleDef {
    name: String,
    #[serde(rename = "abstract", default = "false_")]
    is_abstract: bool,
    #[serde(default = "Vec::new")]
    bases: Vec<String>,
    #[serde(default = "min_rev_default")]
    minrev: u32,
    #[serde(default = "max_rev_default")]
    maxrev: u32,
    submodule: Option<SubmoduleDef>,
    #[serde(rename = "gitmodules-url-template")]
    gitmodules_url_template: Option<String>,
    #[serde(rename = "branch", default = "Vec::new")]
    branches: Vec<BranchRuleDef>,
    #[serde(rename = "tag", default = "Vec::new")]
    tags: Vec<BranchRuleDef>,
    #[serde(rename = "content", default = "Vec::new")]
    contents: Vec<ContentRuleDef>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmoduleDef {
    of: String,
    path: String,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct BranchRuleDef {
    prefix: String,
    name: String,
    #[serde(default = "min_rev_default")]
    minrev: u32,
    #[serde(default = "max_rev_default")]
    maxrev: u32,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ContentRuleDef {
    #[serde(default = "String::new")]
    prefix: String,
    #[serde(default = "String::new")]
    path: String,
    #[serde(default = "min_rev_default")]
    minrev: u32,
    #[serde(default = "max_rev_default")]
    maxrev: u32,
}

#[inline(always)]
fn false_() -> bool {
    false
}

#[inline(always)]
fn min_rev_default() -> u32 {
    0
}

#[inline(always)]
fn max_rev_default() -> u32 {
    u32::MAX
}

pub const DEFAULT_GITMODULES_URL_TEMPLATE: &str = "https://github.com/example/{name}.git";

/// Per-repository configuration after merging all rule blocks of the same
/// name.
pub struct RepoConfig {
    pub name: String,
    pub submodule: Option<SubmoduleSpec>,
    pub gitmodules_url_template: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmoduleSpec {
    /// Name of the super-repository this repo is mounted in.
    pub in_repo: String,
    /// Mount point inside the super-repository.
    pub path: Vec<u8>,
}

pub struct Ruleset {
    repos: Vec<RepoConfig>,
    repo_index: FHashMap<String, usize>,
    matcher: RuleMatcher,
}

pub enum LoadError {
    Parse(toml::de::Error),
    Fatal(Fatal),
    BadPrefix { repo: String, prefix: String },
    UnknownBase { repo: String, base: String },
    UnknownSuperModule { repo: String, super_module: String },
    AbstractSubmodule { repo: String },
}

impl From<Fatal> for LoadError {
    #[inline]
    fn from(e: Fatal) -> Self {
        Self::Fatal(e)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Parse(ref e) => e.fmt(f),
            Self::Fatal(ref e) => e.fmt(f),
            Self::BadPrefix {
                ref repo,
                ref prefix,
            } => {
                write!(f, "invalid svn prefix \"{prefix}\" in repository \"{repo}\"")
            }
            Self::UnknownBase { ref repo, ref base } => {
                write!(f, "repository \"{repo}\" inherits from unknown base \"{base}\"")
            }
            Self::UnknownSuperModule {
                ref repo,
                ref super_module,
            } => {
                write!(
                    f,
                    "repository \"{repo}\" declares unknown super-module \"{super_module}\"",
                )
            }
            Self::AbstractSubmodule { ref repo } => {
                write!(f, "abstract repository \"{repo}\" cannot be a submodule")
            }
        }
    }
}

impl Ruleset {
    pub fn load(raw: &str) -> Result<Self, LoadError> {
        let file: RulesFile = toml::from_str(raw).map_err(LoadError::Parse)?;
        Self::build(file)
    }

    #[inline]
    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    #[inline]
    pub fn repos(&self) -> &[RepoConfig] {
        &self.repos
    }

    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repo_index.get(name).map(|&i| &self.repos[i])
    }

    fn build(file: RulesFile) -> Result<Self, LoadError> {
        // Group rule blocks by name, keeping declaration order.
        let mut def_index = HashMap::<&str, Vec<usize>>::new();
        for (def_i, def) in file.repositories.iter().enumerate() {
            def_index.entry(&def.name).or_default().push(def_i);
        }

        for def in file.repositories.iter() {
            for base in def.bases.iter() {
                if !def_index.contains_key(base.as_str()) {
                    return Err(LoadError::UnknownBase {
                        repo: def.name.clone(),
                        base: base.clone(),
                    });
                }
            }
        }

        check_base_cycles(&file.repositories, &def_index)?;

        let mut repos = Vec::<RepoConfig>::new();
        let mut repo_index = FHashMap::<String, usize>::default();
        let mut matcher_builder = matcher::Builder::new();

        for def in file.repositories.iter() {
            if def.is_abstract {
                if def.submodule.is_some() {
                    return Err(LoadError::AbstractSubmodule {
                        repo: def.name.clone(),
                    });
                }
                continue;
            }

            let repo_i = match repo_index.get(&def.name) {
                Some(&repo_i) => repo_i,
                None => {
                    let repo_i = repos.len();
                    repos.push(RepoConfig {
                        name: def.name.clone(),
                        submodule: None,
                        gitmodules_url_template: DEFAULT_GITMODULES_URL_TEMPLATE.into(),
                    });
                    repo_index.insert(def.name.clone(), repo_i);
                    repo_i
                }
            };

            if let Some(ref submodule) = def.submodule {
                let spec = SubmoduleSpec {
                    in_repo: submodule.of.clone(),
                    path: normalize_prefix(&submodule.path).ok_or_else(|| {
                        LoadError::BadPrefix {
                            repo: def.name.clone(),
                            prefix: submodule.path.clone(),
                        }
                    })?,
                };
                match repos[repo_i].submodule {
                    None => repos[repo_i].submodule = Some(spec),
                    Some(ref existing) => {
                        if existing.in_repo != spec.in_repo {
                            return Err(Fatal::ConflictingSuperModule {
                                repo: def.name.clone(),
                                existing: existing.in_repo.clone(),
                                conflicting: spec.in_repo,
                            }
                            .into());
                        }
                        if existing.path != spec.path {
                            return Err(Fatal::ConflictingSubmodulePath {
                                repo: def.name.clone(),
                                existing: existing.path.clone(),
                                conflicting: spec.path,
                            }
                            .into());
                        }
                    }
                }
            }
            if let Some(ref template) = def.gitmodules_url_template {
                repos[repo_i].gitmodules_url_template = template.clone();
            }

            add_effective_rules(
                &file.repositories,
                &def_index,
                def,
                &mut matcher_builder,
            )?;
        }

        // Super-module references must resolve and must not form cycles.
        for repo in repos.iter() {
            if let Some(ref submodule) = repo.submodule {
                if !repo_index.contains_key(&submodule.in_repo) {
                    return Err(LoadError::UnknownSuperModule {
                        repo: repo.name.clone(),
                        super_module: submodule.in_repo.clone(),
                    });
                }
            }
        }
        check_submodule_cycles(&repos, &repo_index)?;

        Ok(Self {
            repos,
            repo_index,
            matcher: matcher_builder.finish(),
        })
    }
}

/// Flattens one repo rule block (with inherited content rules) into matcher
/// entries: one per branch/tag rule times content rule, with intersected
/// revision windows.
fn add_effective_rules(
    defs: &[RepoRuleDef],
    def_index: &HashMap<&str, Vec<usize>>,
    def: &RepoRuleDef,
    builder: &mut matcher::Builder,
) -> Result<(), LoadError> {
    let mut branches = Vec::<(&BranchRuleDef, bool)>::new();
    let mut contents = Vec::<&ContentRuleDef>::new();
    collect_inherited(defs, def_index, def, &mut branches, &mut contents);

    static IMPLICIT_MASTER: BranchRuleDef = BranchRuleDef {
        prefix: String::new(),
        name: String::new(),
        minrev: 0,
        maxrev: u32::MAX,
    };
    static IMPLICIT_CONTENT: ContentRuleDef = ContentRuleDef {
        prefix: String::new(),
        path: String::new(),
        minrev: 0,
        maxrev: u32::MAX,
    };

    if branches.is_empty() {
        branches.push((&IMPLICIT_MASTER, false));
    }
    if contents.is_empty() {
        contents.push(&IMPLICIT_CONTENT);
    }

    for &(branch, is_tag) in branches.iter() {
        let branch_prefix =
            normalize_prefix(&branch.prefix).ok_or_else(|| LoadError::BadPrefix {
                repo: def.name.clone(),
                prefix: branch.prefix.clone(),
            })?;
        let ref_name = if branch.name.is_empty() {
            "refs/heads/master".into()
        } else if is_tag {
            format!("refs/tags/{}", branch.name)
        } else {
            format!("refs/heads/{}", branch.name)
        };

        for &content in contents.iter() {
            let content_prefix =
                normalize_prefix(&content.prefix).ok_or_else(|| LoadError::BadPrefix {
                    repo: def.name.clone(),
                    prefix: content.prefix.clone(),
                })?;

            let min_rev = def.minrev.max(branch.minrev).max(content.minrev);
            let max_rev = def.maxrev.min(branch.maxrev).min(content.maxrev);
            if min_rev > max_rev {
                continue;
            }

            let mut svn_prefix = branch_prefix.clone();
            if !svn_prefix.is_empty() && !content_prefix.is_empty() {
                svn_prefix.push(b'/');
            }
            svn_prefix.extend_from_slice(&content_prefix);

            builder.add(matcher::MatchRule {
                svn_prefix,
                branch_prefix_len: branch_prefix.len(),
                min_rev,
                max_rev,
                repo: def.name.clone(),
                ref_name: ref_name.clone(),
                is_tag,
                git_path: normalize_git_path(&content.path),
                decl_order: 0, // assigned by the builder
            });
        }
    }

    Ok(())
}

fn collect_inherited<'a>(
    defs: &'a [RepoRuleDef],
    def_index: &HashMap<&str, Vec<usize>>,
    def: &'a RepoRuleDef,
    branches: &mut Vec<(&'a BranchRuleDef, bool)>,
    contents: &mut Vec<&'a ContentRuleDef>,
) {
    branches.extend(def.branches.iter().map(|b| (b, false)));
    branches.extend(def.tags.iter().map(|t| (t, true)));
    contents.extend(def.contents.iter());

    for base in def.bases.iter() {
        for &base_i in def_index[base.as_str()].iter() {
            collect_inherited(defs, def_index, &defs[base_i], branches, contents);
        }
    }
}

fn check_base_cycles(
    defs: &[RepoRuleDef],
    def_index: &HashMap<&str, Vec<usize>>,
) -> Result<(), Fatal> {
    // DFS over names; a name on the current stack means a cycle.
    fn visit<'a>(
        name: &'a str,
        defs: &'a [RepoRuleDef],
        def_index: &HashMap<&str, Vec<usize>>,
        done: &mut FHashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), Fatal> {
        if let Some(pos) = stack.iter().position(|&n| n == name) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|&n| n.into()).collect();
            cycle.push(name.into());
            return Err(Fatal::RuleCycle {
                kind: "repository bases",
                cycle,
            });
        }
        if !done.insert(name) {
            return Ok(());
        }

        stack.push(name);
        for &def_i in def_index[name].iter() {
            for base in defs[def_i].bases.iter() {
                visit(base, defs, def_index, done, stack)?;
            }
        }
        stack.pop();
        Ok(())
    }

    let mut done = FHashSet::default();
    let mut stack = Vec::new();
    for def in defs.iter() {
        visit(&def.name, defs, def_index, &mut done, &mut stack)?;
    }
    Ok(())
}

fn check_submodule_cycles(
    repos: &[RepoConfig],
    repo_index: &FHashMap<String, usize>,
) -> Result<(), Fatal> {
    for (start_i, start) in repos.iter().enumerate() {
        let mut seen = vec![start_i];
        let mut current = start;
        while let Some(ref submodule) = current.submodule {
            let super_i = repo_index[&submodule.in_repo];
            if seen.contains(&super_i) {
                let mut cycle: Vec<String> =
                    seen.iter().map(|&i| repos[i].name.clone()).collect();
                cycle.push(repos[super_i].name.clone());
                return Err(Fatal::RuleCycle {
                    kind: "super/submodule relationships",
                    cycle,
                });
            }
            seen.push(super_i);
            current = &repos[super_i];
        }
    }
    Ok(())
}

/// Strips leading/trailing slashes; rejects empty components and absolute
/// escapes. Empty input is a valid empty prefix.
fn normalize_prefix(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        if raw.chars().filter(|&c| c == '/').count() > 1 {
            return None;
        }
        return Some(Vec::new());
    }
    if trimmed.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return None;
    }
    Some(trimmed.as_bytes().to_vec())
}

fn normalize_git_path(raw: &str) -> Vec<u8> {
    raw.trim_matches('/').as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::{LoadError, Ruleset};
    use crate::errors::Fatal;

    #[test]
    fn test_merged_repo_blocks() {
        let ruleset = Ruleset::load(
            r#"
            [[repository]]
            name = "a"
            maxrev = 100
            [[repository.branch]]
            prefix = "trunk"
            name = "master"

            [[repository]]
            name = "a"
            minrev = 101
            [[repository.branch]]
            prefix = "branches/stable"
            name = "stable"
            "#,
        )
        .map_err(|e| e.to_string())
        .unwrap();

        assert_eq!(ruleset.repos().len(), 1);
        assert!(ruleset.matcher().longest_match(b"trunk/f", 50).is_some());
        assert!(ruleset.matcher().longest_match(b"trunk/f", 150).is_none());
        assert!(ruleset
            .matcher()
            .longest_match(b"branches/stable/f", 150)
            .is_some());
    }

    #[test]
    fn test_base_cycle_rejected() {
        let err = Ruleset::load(
            r#"
            [[repository]]
            name = "a"
            abstract = true
            bases = ["b"]

            [[repository]]
            name = "b"
            abstract = true
            bases = ["a"]

            [[repository]]
            name = "c"
            bases = ["a"]
            "#,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            LoadError::Fatal(Fatal::RuleCycle { kind: "repository bases", .. })
        ));
    }

    #[test]
    fn test_submodule_cycle_rejected() {
        let err = Ruleset::load(
            r#"
            [[repository]]
            name = "a"
            submodule = { of = "b", path = "libs/a" }

            [[repository]]
            name = "b"
            submodule = { of = "a", path = "libs/b" }
            "#,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            LoadError::Fatal(Fatal::RuleCycle { kind: "super/submodule relationships", .. })
        ));
    }

    #[test]
    fn test_conflicting_submodule_specs_rejected() {
        let err = Ruleset::load(
            r#"
            [[repository]]
            name = "super"

            [[repository]]
            name = "child"
            submodule = { of = "super", path = "libs/child" }

            [[repository]]
            name = "child"
            minrev = 100
            submodule = { of = "other", path = "libs/child" }

            [[repository]]
            name = "other"
            "#,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            LoadError::Fatal(Fatal::ConflictingSuperModule { .. })
        ));
    }

    #[test]
    fn test_abstract_repo_contributes_rules_only() {
        let ruleset = Ruleset::load(
            r#"
            [[repository]]
            name = "common"
            abstract = true
            [[repository.branch]]
            prefix = "trunk"
            name = "master"

            [[repository]]
            name = "a"
            bases = ["common"]
            [[repository.content]]
            prefix = "libs/a"
            path = ""
            "#,
        )
        .map_err(|e| e.to_string())
        .unwrap();

        assert_eq!(ruleset.repos().len(), 1);
        let m = ruleset
            .matcher()
            .longest_match(b"trunk/libs/a/file.c", 1)
            .unwrap();
        assert_eq!(m.rule.repo, "a");
        assert_eq!(m.rule.ref_name, "refs/heads/master");
        assert_eq!(m.git_path(), b"file.c");
    }
}
