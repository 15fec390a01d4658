use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use crate::authors::AuthorMap;
use crate::errors::Fatal;
use crate::git::fast_import::{self, ChannelFactory, SinkRegistry};
use crate::git::process_cache::{ProcessCache, MAX_SIMULTANEOUS_PROCESSES};
use crate::git::repository::{CommitMeta, Repository, SuperLink, Tuning};
use crate::rules::{MatchResult, Ruleset};
use crate::svn::{Change, ChangeAction, NodeKind, Svn};
use crate::term_out::ProgressPrint;
use crate::FHashMap;

pub struct Options {
    pub git_executable: PathBuf,
    pub work_dir: PathBuf,
    pub dry_run: bool,
    pub add_metadata: bool,
    pub add_metadata_notes: bool,
    pub commit_interval: u64,
    pub resume_from: Option<u32>,
    pub max_rev: Option<u32>,
    pub debug_rules: bool,
    pub coverage: bool,
    pub svn_branches: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            git_executable: "git".into(),
            work_dir: ".".into(),
            dry_run: false,
            add_metadata: false,
            add_metadata_notes: false,
            commit_interval: 10000,
            resume_from: None,
            max_rev: None,
            debug_rules: false,
            coverage: false,
            svn_branches: false,
        }
    }
}

/// The revision dispatcher: walks the svn log in order, classifies every
/// changed path through the rule matcher and drives the open/close commit
/// protocol across all affected repositories.
pub struct Importer<'a> {
    options: &'a Options,
    ruleset: &'a Ruleset,
    svn: &'a mut dyn Svn,
    authors: &'a AuthorMap,
    progress: ProgressPrint,
    factory: ChannelFactory,
    repos: Vec<Repository>,
    repo_index: FHashMap<String, usize>,
    process_cache: ProcessCache,
    /// Repositories affected by the revision being processed, in touch
    /// order.
    touched: Vec<usize>,
    coverage_hits: Vec<u64>,
}

impl<'a> Importer<'a> {
    pub fn new(
        options: &'a Options,
        ruleset: &'a Ruleset,
        svn: &'a mut dyn Svn,
        authors: &'a AuthorMap,
        progress: ProgressPrint,
        sink_registry: Option<SinkRegistry>,
    ) -> Self {
        let factory = match sink_registry {
            Some(registry) => ChannelFactory::Sink(registry),
            None if options.dry_run => ChannelFactory::Sink(SinkRegistry::new()),
            None => ChannelFactory::Real {
                git: options.git_executable.clone(),
            },
        };

        let coverage_hits = vec![0; ruleset.matcher().num_rules()];

        Self {
            options,
            ruleset,
            svn,
            authors,
            progress,
            factory,
            repos: Vec::new(),
            repo_index: FHashMap::default(),
            process_cache: ProcessCache::new(MAX_SIMULTANEOUS_PROCESSES),
            touched: Vec::new(),
            coverage_hits,
        }
    }

    /// Runs the whole import: resume bookkeeping, the revision loop, tag
    /// finalization and teardown.
    pub fn run(&mut self) -> Result<(), Fatal> {
        let first_rev = self.prepare()?;

        let latest = self.svn.latest_revision()?;
        let max_rev = self.options.max_rev.map_or(latest, |m| m.min(latest));

        if first_rev > max_rev {
            tracing::info!("nothing to do: already imported up to revision {max_rev}");
        }

        for rev in first_rev..=max_rev {
            self.progress
                .set_status(format!("importing revision {rev} / {max_rev}"));
            self.import_revision(rev)?;
        }

        self.finish()
    }

    fn demand_repo(&mut self, name: &str) -> Result<usize, Fatal> {
        if let Some(&repo_i) = self.repo_index.get(name) {
            return Ok(repo_i);
        }

        let config = self
            .ruleset
            .repo(name)
            .expect("matched rule names an unknown repository");

        let tuning = Tuning {
            add_metadata: self.options.add_metadata,
            add_metadata_notes: self.options.add_metadata_notes,
            commit_interval: self.options.commit_interval.max(1),
        };
        let mut repo = Repository::create(name, &self.options.work_dir, &self.factory, tuning)?;

        // Submodule wiring first: the super-repository is materialized
        // before its child (the ruleset guarantees this terminates).
        if let Some(submodule) = config.submodule.clone() {
            let super_i = self.demand_repo(&submodule.in_repo)?;
            self.repos[super_i].has_submodules = true;
            repo.super_module = Some(SuperLink {
                repo: super_i,
                path: submodule.path,
            });
        }

        let repo_i = self.repos.len();
        self.repos.push(repo);
        self.repo_index.insert(name.into(), repo_i);
        Ok(repo_i)
    }

    /// Registers a repository as affected by the current revision and keeps
    /// the fast-import process pool within its limit.
    fn mark_touched(&mut self, repo_i: usize) {
        if self.touched.contains(&repo_i) {
            return;
        }
        self.touched.push(repo_i);

        for victim in self.process_cache.touch(repo_i) {
            self.repos[victim].close_fast_import();
        }
    }

    /// Dirties a ref, walking up the super-module chain: a dirty child ref
    /// dirties the same-named ref in its super-repository and defers the
    /// super's commits until the child closed. Returns false when
    /// discovery is disallowed and the ref was clean.
    pub(crate) fn modify_ref(
        &mut self,
        repo_i: usize,
        ref_name: &str,
        allow_discovery: bool,
    ) -> bool {
        let mut repo_i = repo_i;
        let mut allow = allow_discovery;
        loop {
            match self.repos[repo_i].modify_ref(ref_name, allow) {
                None => return false,
                Some(false) => return true,
                Some(true) => {
                    self.mark_touched(repo_i);
                    match self.repos[repo_i].super_module.clone() {
                        Some(link) => {
                            self.repos[link.repo].modified_submodule_refs += 1;
                            repo_i = link.repo;
                            allow = true;
                        }
                        None => return true,
                    }
                }
            }
        }
    }

    fn demand_txn(
        &mut self,
        repo_i: usize,
        ref_name: &str,
        svn_prefix: &[u8],
        rev: u32,
    ) -> Result<usize, Fatal> {
        self.modify_ref(repo_i, ref_name, true);
        self.repos[repo_i].demand_transaction(ref_name, svn_prefix, rev)
    }

    fn note_rule_hit(&mut self, m: &MatchResult<'_>, path: &[u8]) {
        self.coverage_hits[m.rule_index] += 1;
        if self.options.debug_rules {
            tracing::debug!(
                "path \"{}\" matched rule /{} -> {} {}",
                path.escape_ascii(),
                String::from_utf8_lossy(&m.rule.svn_prefix),
                m.rule.repo,
                m.rule.ref_name,
            );
        }
    }

    pub fn import_revision(&mut self, rev: u32) -> Result<(), Fatal> {
        tracing::debug!("importing revision {rev}");

        let changes = self.svn.changes(rev)?;
        let props = self.svn.rev_props(rev)?;
        let uuid = self.svn.uuid();
        let meta = CommitMeta {
            author: self.authors.committer(props.author.as_deref(), uuid.as_ref()),
            epoch: props.epoch,
            log: props.log,
        };

        for change in changes.iter() {
            self.process_change(rev, change, &meta)?;
        }

        self.close_revision(rev, &meta)
    }

    fn process_change(
        &mut self,
        rev: u32,
        change: &Change,
        meta: &CommitMeta,
    ) -> Result<(), Fatal> {
        if change.action == ChangeAction::Delete {
            return self.process_delete(rev, &change.path);
        }

        let matcher = self.ruleset.matcher();
        let Some(m) = matcher.longest_match(&change.path, rev) else {
            tracing::debug!(
                "no rule matches \"{}\" at r{rev}; ignoring",
                change.path.escape_ascii(),
            );
            return Ok(());
        };
        self.note_rule_hit(&m, &change.path);

        match change.kind {
            NodeKind::File => self.process_file_change(rev, change, &m),
            NodeKind::Dir => self.process_dir_change(rev, change, &m, meta),
        }
    }

    fn process_file_change(
        &mut self,
        rev: u32,
        change: &Change,
        m: &MatchResult<'_>,
    ) -> Result<(), Fatal> {
        let repo_i = self.demand_repo(&m.rule.repo)?;
        let ref_name = m.rule.ref_name.clone();
        let svn_prefix = m.rule.svn_prefix.clone();
        let ref_idx = self.demand_txn(repo_i, &ref_name, &svn_prefix, rev)?;

        if let Some((ref src_path, src_rev)) = change.copy_from {
            self.note_branch_copy(repo_i, ref_idx, &ref_name, src_path, src_rev);
        }

        let content = self.svn.cat(rev, &change.path)?;
        self.repos[repo_i].add_file(ref_idx, &m.git_path(), content.mode, &content.data)
    }

    fn process_dir_change(
        &mut self,
        rev: u32,
        change: &Change,
        m: &MatchResult<'_>,
        meta: &CommitMeta,
    ) -> Result<(), Fatal> {
        let is_copy = change.copy_from.is_some();

        if m.is_branch_root() {
            match change.action {
                ChangeAction::Add | ChangeAction::Replace => {
                    if change.action == ChangeAction::Replace {
                        self.delete_whole_branch(rev, m)?;
                    }
                    if let Some((ref src_path, src_rev)) = change.copy_from {
                        self.create_branch_from_copy(rev, m, src_path, src_rev, meta)?;
                    }
                    // A plain directory add creates the branch lazily, when
                    // files arrive.
                }
                ChangeAction::Modify => {}
                ChangeAction::Delete => unreachable!(),
            }
            return Ok(());
        }

        if is_copy {
            // A directory copied below a branch root fans out through the
            // matcher, one file at a time.
            let (src_path, src_rev) = change.copy_from.clone().unwrap();
            let repo_i = self.demand_repo(&m.rule.repo)?;
            let ref_name = m.rule.ref_name.clone();
            let svn_prefix = m.rule.svn_prefix.clone();
            let ref_idx = self.demand_txn(repo_i, &ref_name, &svn_prefix, rev)?;
            self.note_branch_copy(repo_i, ref_idx, &ref_name, &src_path, src_rev);
            self.rewrite_tree(rev, &change.path)?;
        }

        Ok(())
    }

    fn process_delete(&mut self, rev: u32, path: &[u8]) -> Result<(), Fatal> {
        let matcher = self.ruleset.matcher();
        let Some(m) = matcher.longest_match(path, rev) else {
            tracing::debug!(
                "deletion of unmatched path \"{}\" at r{rev}; ignoring",
                path.escape_ascii(),
            );
            return Ok(());
        };
        self.note_rule_hit(&m, path);

        // Deleting the branch root, or everything a repository maps below
        // a branch, is a branch-level deletion for that repository.
        let whole_branch =
            m.svn_suffix().is_empty() && (m.is_branch_root() || m.rule.git_path.is_empty());

        if whole_branch {
            self.delete_whole_branch(rev, &m)
        } else {
            let repo_i = self.demand_repo(&m.rule.repo)?;
            let ref_name = m.rule.ref_name.clone();
            let svn_prefix = m.rule.svn_prefix.clone();
            let ref_idx = self.demand_txn(repo_i, &ref_name, &svn_prefix, rev)?;
            self.repos[repo_i].delete_file(ref_idx, &m.git_path());
            Ok(())
        }
    }

    fn delete_whole_branch(&mut self, rev: u32, m: &MatchResult<'_>) -> Result<(), Fatal> {
        let repo_i = self.demand_repo(&m.rule.repo)?;
        let ref_name = m.rule.ref_name.clone();

        if let Some(mark) = self.repos[repo_i].delete_branch(&ref_name, rev) {
            self.mark_touched(repo_i);
            self.propagate_submodule(repo_i, &ref_name, mark, rev)?;
        }
        Ok(())
    }

    fn create_branch_from_copy(
        &mut self,
        rev: u32,
        m: &MatchResult<'_>,
        src_path: &[u8],
        src_rev: u32,
        meta: &CommitMeta,
    ) -> Result<(), Fatal> {
        let matcher = self.ruleset.matcher();
        let dst_repo = m.rule.repo.clone();
        let dst_ref = m.rule.ref_name.clone();
        let dst_svn_path = m.rule.svn_prefix.clone();

        let src = matcher.longest_match(src_path, src_rev);
        let src_in_repo = src
            .as_ref()
            .filter(|sm| sm.rule.repo == dst_repo && sm.is_branch_root())
            .map(|sm| sm.rule.ref_name.clone());

        let repo_i = self.demand_repo(&dst_repo)?;

        match src_in_repo {
            Some(src_ref) => {
                let mark =
                    self.repos[repo_i].create_branch(&dst_ref, rev, &src_ref, src_rev)?;
                self.mark_touched(repo_i);
                self.propagate_submodule(repo_i, &dst_ref, mark, rev)?;

                if m.rule.is_tag {
                    self.repos[repo_i].create_annotated_tag(
                        &dst_ref,
                        &dst_svn_path,
                        rev,
                        &meta.author,
                        meta.epoch,
                        &meta.log,
                    );
                }

                if self.options.svn_branches || mark == 0 {
                    // Populate the new branch from the svn tree instead of
                    // trusting the copy source's history.
                    self.rewrite_tree(rev, m.branch_svn_path())?;
                }
            }
            None => {
                tracing::debug!(
                    "branch copy source \"{}\"@r{src_rev} does not map onto a branch of \
                     repository {dst_repo}; rewriting the tree from svn",
                    src_path.escape_ascii(),
                );
                self.rewrite_tree(rev, m.branch_svn_path())?;
            }
        }

        Ok(())
    }

    /// Adds every file below `dir` (as of `rev`) to the transactions of
    /// whichever refs the matcher routes them to.
    fn rewrite_tree(&mut self, rev: u32, dir: &[u8]) -> Result<(), Fatal> {
        let files = self.svn.tree(rev, dir)?;
        let matcher = self.ruleset.matcher();

        for file in files {
            let Some(m) = matcher.longest_match(&file, rev) else {
                continue;
            };
            self.note_rule_hit(&m, &file);

            let repo_i = self.demand_repo(&m.rule.repo)?;
            let ref_name = m.rule.ref_name.clone();
            let svn_prefix = m.rule.svn_prefix.clone();
            let git_path = m.git_path();
            let ref_idx = self.demand_txn(repo_i, &ref_name, &svn_prefix, rev)?;

            let content = self.svn.cat(rev, &file)?;
            self.repos[repo_i].add_file(ref_idx, &git_path, content.mode, &content.data)?;
        }

        Ok(())
    }

    /// Copies whose source and destination live on different refs of the
    /// same repository become merge parents.
    fn note_branch_copy(
        &mut self,
        repo_i: usize,
        dst_ref_idx: usize,
        dst_ref_name: &str,
        src_path: &[u8],
        src_rev: u32,
    ) {
        let matcher = self.ruleset.matcher();
        let Some(sm) = matcher.longest_match(src_path, src_rev) else {
            return;
        };
        if sm.rule.repo != self.repos[repo_i].name || sm.rule.ref_name == dst_ref_name {
            return;
        }

        let src_ref_name = sm.rule.ref_name.clone();
        self.repos[repo_i].note_copy_from_branch(dst_ref_idx, &src_ref_name, src_rev);
    }

    /// Propagates a ref change of a submodule child into its
    /// super-repository: gitlink entry plus `.gitmodules` bookkeeping.
    fn propagate_submodule(
        &mut self,
        child_i: usize,
        ref_name: &str,
        mark: u32,
        rev: u32,
    ) -> Result<(), Fatal> {
        let Some(link) = self.repos[child_i].super_module.clone() else {
            return Ok(());
        };
        let parent_i = link.repo;
        let deletion = mark == 0;

        let child_repo = if deletion { None } else { Some(child_i) };
        let parent_ref_idx = self.repos[parent_i].demand_ref(ref_name);
        if !self.repos[parent_i].set_submodule(parent_ref_idx, &link.path, child_repo, rev) {
            // No gitlink there to delete.
            return Ok(());
        }

        tracing::debug!(
            "submodule {} of repository {} {} in branch {ref_name} of r{rev}",
            link.path.escape_ascii(),
            self.repos[parent_i].name,
            if deletion {
                "deleted".to_string()
            } else {
                format!("updated to mark :{mark}")
            },
        );

        let ref_idx = self.demand_txn(parent_i, ref_name, b"", rev)?;
        if deletion {
            self.repos[parent_i].delete_file(ref_idx, &link.path);
        } else {
            self.repos[parent_i].update_submodule_entry(ref_idx, &link.path, mark);
        }

        Ok(())
    }

    fn write_gitmodules(&mut self, repo_i: usize, ref_idx: usize, rev: u32) -> Result<(), Fatal> {
        let entries = self.repos[repo_i].submodules_of(ref_idx);

        let mut content = Vec::<u8>::new();
        for (path, child_i) in entries {
            let child_name = self.repos[child_i].name.clone();
            let url = self
                .ruleset
                .repo(&child_name)
                .map(|c| c.gitmodules_url_template.clone())
                .unwrap_or_else(|| crate::rules::DEFAULT_GITMODULES_URL_TEMPLATE.into())
                .replace("{name}", &child_name);

            content.extend_from_slice(b"[submodule \"");
            content.extend_from_slice(&path);
            content.extend_from_slice(b"\"]\n\tpath = ");
            content.extend_from_slice(&path);
            content.extend_from_slice(b"\n\turl = ");
            content.extend_from_slice(url.as_bytes());
            content.push(b'\n');
        }

        let ref_name = self.repos[repo_i].ref_name(ref_idx).to_string();
        self.demand_txn(repo_i, &ref_name, b"", rev)?;
        self.repos[repo_i].add_file(ref_idx, b".gitmodules", 0o100644, &content)
    }

    /// Opens the next commit of a repository and forwards the fresh mark
    /// up the submodule chain.
    fn open_and_forward(&mut self, repo_i: usize, rev: u32, meta: &CommitMeta) -> Result<(), Fatal> {
        if self.repos[repo_i].is_open() {
            return Ok(());
        }
        let Some(next_ref) = self.repos[repo_i].next_ref_to_open() else {
            return Ok(());
        };

        if self.repos[repo_i].ref_needs_gitmodules(next_ref, rev) {
            self.write_gitmodules(repo_i, next_ref, rev)?;
        }

        if let Some(opened) = self.repos[repo_i].open_commit(rev, meta)? {
            let ref_name = self.repos[repo_i].ref_name(opened.ref_idx).to_string();
            self.propagate_submodule(repo_i, &ref_name, opened.mark, rev)?;
        }
        Ok(())
    }

    /// End-of-revision commit protocol: queued branch commands flush
    /// first; then commits open and `ls` goes out for every repository
    /// whose close is not deferred; then the close loop runs to a
    /// fixpoint, with submodule parents opening only after all of their
    /// children closed.
    fn close_revision(&mut self, rev: u32, meta: &CommitMeta) -> Result<(), Fatal> {
        if self.touched.is_empty() {
            return Ok(());
        }

        for repo_i in self.touched.clone() {
            self.repos[repo_i].prepare_commit(rev)?;
        }

        // Discovery pass.
        for repo_i in self.touched.clone() {
            if self.repos[repo_i].defer_close(true) {
                continue;
            }
            self.open_and_forward(repo_i, rev, meta)?;
            self.repos[repo_i].prepare_to_close_commit(true)?;
        }

        // Close loop.
        while !self.touched.is_empty() {
            let mut progressed = false;

            for repo_i in self.touched.clone() {
                if !self.repos[repo_i].is_open() && !self.repos[repo_i].has_dirty_refs() {
                    self.finish_repo_revision(repo_i);
                    progressed = true;
                    continue;
                }
                if self.repos[repo_i].defer_close(false) {
                    continue;
                }

                if !self.repos[repo_i].is_open() {
                    // A deferred repository whose children have all closed.
                    self.open_and_forward(repo_i, rev, meta)?;
                    self.repos[repo_i].prepare_to_close_commit(false)?;
                }

                let clean = self.repos[repo_i].close_commit(meta)?;
                progressed = true;

                if let Some(link) = self.repos[repo_i].super_module.clone() {
                    self.repos[link.repo].modified_submodule_refs -= 1;
                }

                if clean {
                    self.finish_repo_revision(repo_i);
                } else {
                    // More dirty refs: open the next one right away so its
                    // ls is in flight for the next sweep.
                    self.open_and_forward(repo_i, rev, meta)?;
                    self.repos[repo_i].prepare_to_close_commit(false)?;
                }
            }

            if !progressed {
                let stuck = self
                    .touched
                    .iter()
                    .map(|&i| self.repos[i].name.clone())
                    .collect();
                return Err(Fatal::RuleCycle {
                    kind: "deferred submodule closes",
                    cycle: stuck,
                });
            }
        }

        Ok(())
    }

    fn finish_repo_revision(&mut self, repo_i: usize) {
        self.repos[repo_i].end_revision();
        if let Some(pos) = self.touched.iter().position(|&i| i == repo_i) {
            self.touched.remove(pos);
        }
    }

    /// Scans per-repository logs and marks files to find the first
    /// revision to import, truncating logs past the cutoff (with a `.old`
    /// backup) and seeding ref state from the surviving entries.
    pub fn prepare(&mut self) -> Result<u32, Fatal> {
        let mut cutoff = self.options.resume_from.unwrap_or(u32::MAX);

        let repo_names: Vec<String> =
            self.ruleset.repos().iter().map(|r| r.name.clone()).collect();

        // A rewind in any repository (a logged mark the marks file does not
        // know) forces re-scanning all of them with the lower cutoff.
        let mut scans;
        'rescan: loop {
            scans = Vec::new();
            for name in repo_names.iter() {
                let log_path = self.options.work_dir.join(fast_import::log_file_name(name));
                if !log_path.exists() {
                    continue;
                }

                let marks_path = self
                    .options
                    .work_dir
                    .join(name)
                    .join(fast_import::marks_file_name(name));
                let last_valid = fast_import::last_valid_mark(&marks_path);

                let scan = scan_log(&log_path, cutoff, last_valid).map_err(|e| {
                    Fatal::LogFile {
                        path: log_path.clone(),
                        error: e,
                    }
                })?;

                if let Some(rewind_rev) = scan.rewind {
                    tracing::warn!(
                        "{name}: unknown commit mark found: rewinding -- did you hit Ctrl-C?",
                    );
                    cutoff = rewind_rev;
                    continue 'rescan;
                }

                scans.push((name.clone(), scan));
            }
            break;
        }

        let mut first_rev = 1;
        for (name, scan) in scans {
            let log_path = self.options.work_dir.join(fast_import::log_file_name(name.as_str()));
            let backup = backup_path(&log_path);

            if let Some(truncate_at) = scan.truncate_at {
                // Keep a copy since we are about to drop history.
                let _ = std::fs::remove_file(&backup);
                std::fs::copy(&log_path, &backup).map_err(|e| Fatal::LogFile {
                    path: log_path.clone(),
                    error: e,
                })?;

                tracing::debug!("{name}: truncating history to revision {cutoff}");
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&log_path)
                    .map_err(|e| Fatal::LogFile {
                        path: log_path.clone(),
                        error: e,
                    })?;
                file.set_len(truncate_at).map_err(|e| Fatal::LogFile {
                    path: log_path.clone(),
                    error: e,
                })?;
            } else {
                // A stale backup would confuse a later restore.
                let _ = std::fs::remove_file(&backup);
            }

            if !scan.entries.is_empty() {
                let repo_i = self.demand_repo(&name)?;
                self.repos[repo_i].incremental = true;
                for (revnum, branch, mark) in scan.entries {
                    self.repos[repo_i].seed_ref_mark(&branch, revnum, mark);
                }
                first_rev = first_rev.max(scan.next_rev);
            }
        }

        Ok(first_rev.min(cutoff))
    }

    /// Puts the `.old` log backups back; called when a run fails before
    /// making progress.
    pub fn restore_logs(&mut self) {
        for config in self.ruleset.repos() {
            let log_path = self
                .options
                .work_dir
                .join(fast_import::log_file_name(&config.name));
            let backup = backup_path(&log_path);
            if backup.exists() {
                let _ = std::fs::remove_file(&log_path);
                let _ = std::fs::rename(&backup, &log_path);
            }
        }
    }

    /// Tag synthesis, channel teardown (which flushes marks files) and the
    /// gitlink fixup pass.
    pub fn finish(&mut self) -> Result<(), Fatal> {
        for repo_i in 0..self.repos.len() {
            self.repos[repo_i].finalize_tags()?;
        }

        // Children must flush marks before their parents' placeholders can
        // be resolved.
        self.process_cache.drain();
        for repo in self.repos.iter_mut() {
            repo.close_fast_import();
        }

        if self.factory.is_real() {
            self.fixup_gitlinks()?;
        }

        if self.options.coverage {
            self.report_coverage();
        }

        Ok(())
    }

    /// Resolves the 40-digit decimal gitlink placeholders in every
    /// super-repository to the child SHAs recorded in the children's marks
    /// files, by piping `git fast-export` through a rewrite into
    /// `git fast-import`.
    fn fixup_gitlinks(&mut self) -> Result<(), Fatal> {
        for parent_i in 0..self.repos.len() {
            if !self.repos[parent_i].has_submodules {
                continue;
            }

            let mut marks_by_path = FHashMap::<Vec<u8>, FHashMap<u32, Vec<u8>>>::default();
            for child in self.repos.iter() {
                let Some(ref link) = child.super_module else {
                    continue;
                };
                if link.repo != parent_i {
                    continue;
                }
                let marks =
                    fast_import::read_marks(&child.marks_path()).map_err(|e| Fatal::LogFile {
                        path: child.marks_path(),
                        error: e,
                    })?;
                marks_by_path.insert(link.path.clone(), marks);
            }

            if marks_by_path.is_empty() {
                continue;
            }

            tracing::info!(
                "resolving gitlink marks in repository {}",
                self.repos[parent_i].name,
            );
            rewrite_gitlinks(
                &self.options.git_executable,
                self.repos[parent_i].git_dir(),
                &self.repos[parent_i].name,
                &marks_by_path,
            )?;
        }

        Ok(())
    }

    fn report_coverage(&self) {
        println!("rule coverage:");
        for (rule, &hits) in self.ruleset.matcher().rules().iter().zip(&self.coverage_hits) {
            println!(
                "{hits:8}  /{} -> {} {}",
                String::from_utf8_lossy(&rule.svn_prefix),
                rule.repo,
                rule.ref_name,
            );
        }
    }

    /// Repository inspection, for tests and the consistency checks.
    pub fn repo(&self, name: &str) -> Option<&Repository> {
        self.repo_index.get(name).map(|&i| &self.repos[i])
    }
}

fn backup_path(log_path: &Path) -> PathBuf {
    let mut backup = log_path.as_os_str().to_owned();
    backup.push(".old");
    PathBuf::from(backup)
}

struct LogScan {
    /// One past the last cleanly recorded revision.
    next_rev: u32,
    /// Revision to rewind the global cutoff to (a logged mark the marks
    /// file has never seen).
    rewind: Option<u32>,
    /// Byte offset to truncate the log at, when entries at or past the
    /// cutoff exist.
    truncate_at: Option<u64>,
    entries: Vec<(u32, String, u32)>,
}

/// Parses `progress SVN r<N> branch <ref> = :<mark>` lines; everything
/// else in the log is ignored. Trailing `# comments` are stripped.
fn scan_log(log_path: &Path, cutoff: u32, last_valid_mark: u32) -> std::io::Result<LogScan> {
    let raw = std::fs::read(log_path)?;

    let mut scan = LogScan {
        next_rev: 1,
        rewind: None,
        truncate_at: None,
        entries: Vec::new(),
    };

    let mut last_revnum = 0;
    let mut pos = 0u64;
    for line in raw.split_inclusive(|&b| b == b'\n') {
        let line_start = pos;
        pos += line.len() as u64;

        let Some((revnum, branch, mark)) = parse_progress_line(line) else {
            continue;
        };

        if revnum >= cutoff {
            scan.truncate_at = Some(line_start);
            break;
        }

        if revnum < last_revnum {
            tracing::warn!(
                "{log_path:?}: revision numbers are not monotonic: \
                 got {last_revnum} and then {revnum}",
            );
        }

        if mark > last_valid_mark {
            scan.rewind = Some(revnum);
            scan.truncate_at = Some(line_start);
            break;
        }

        last_revnum = revnum;
        scan.entries.push((revnum, branch, mark));
    }

    scan.next_rev = last_revnum + 1;
    Ok(scan)
}

fn parse_progress_line(line: &[u8]) -> Option<(u32, String, u32)> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = match line.iter().position(|&b| b == b'#') {
        Some(hash) => &line[..hash],
        None => line,
    };
    let line = line.trim_ascii();

    let rem = line.strip_prefix(b"progress SVN r")?;
    let rev_len = rem.iter().position(|&b| b == b' ')?;
    let revnum: u32 = std::str::from_utf8(&rem[..rev_len]).ok()?.parse().ok()?;

    let rem = rem[rev_len..].strip_prefix(b" branch ")?;
    let eq = rem.windows(4).rposition(|w| w == b" = :")?;
    let branch = std::str::from_utf8(&rem[..eq]).ok()?.to_string();
    let mark: u32 = std::str::from_utf8(rem[(eq + 4)..].trim_ascii())
        .ok()?
        .parse()
        .ok()?;

    Some((revnum, branch, mark))
}

/// Streams `git fast-export` output back into `git fast-import`, replacing
/// placeholder gitlink SHAs. `data` payloads are copied verbatim so commit
/// messages cannot be mangled.
fn rewrite_gitlinks(
    git: &Path,
    git_dir: &Path,
    repo_name: &str,
    marks_by_path: &FHashMap<Vec<u8>, FHashMap<u32, Vec<u8>>>,
) -> Result<(), Fatal> {
    let channel_err = |e: std::io::Error| Fatal::ChannelIo {
        repo: repo_name.into(),
        error: e,
    };

    let mut export = std::process::Command::new(git)
        .arg("fast-export")
        .arg("--no-data")
        .arg("--all")
        .current_dir(git_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .spawn()
        .map_err(channel_err)?;

    let mut import = std::process::Command::new(git)
        .arg("fast-import")
        .arg("--force")
        .arg("--quiet")
        .current_dir(git_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::inherit())
        .spawn()
        .map_err(channel_err)?;

    {
        let mut reader = std::io::BufReader::new(export.stdout.take().unwrap());
        let mut writer = std::io::BufWriter::new(import.stdin.take().unwrap());

        let mut line = Vec::new();
        loop {
            line.clear();
            if std::io::BufRead::read_until(&mut reader, b'\n', &mut line)
                .map_err(channel_err)?
                == 0
            {
                break;
            }

            if let Some(len) = line
                .strip_prefix(b"data ")
                .and_then(|rem| std::str::from_utf8(rem.trim_ascii()).ok())
                .and_then(|rem| rem.parse::<u64>().ok())
            {
                writer.write_all(&line).map_err(channel_err)?;
                let mut payload = (&mut reader).take(len);
                std::io::copy(&mut payload, &mut writer).map_err(channel_err)?;
                continue;
            }

            if let Some(rewritten) = rewrite_gitlink_line(&line, marks_by_path) {
                writer.write_all(&rewritten).map_err(channel_err)?;
            } else {
                writer.write_all(&line).map_err(channel_err)?;
            }
        }

        writer.flush().map_err(channel_err)?;
    }

    for mut child in [export, import] {
        let status = child.wait().map_err(channel_err)?;
        if !status.success() {
            return Err(Fatal::ChannelIo {
                repo: repo_name.into(),
                error: std::io::Error::other(format!("gitlink fixup finished with {status}")),
            });
        }
    }

    Ok(())
}

fn rewrite_gitlink_line(
    line: &[u8],
    marks_by_path: &FHashMap<Vec<u8>, FHashMap<u32, Vec<u8>>>,
) -> Option<Vec<u8>> {
    let rem = line.strip_prefix(b"M 160000 ")?;
    if rem.len() < 41 {
        return None;
    }
    let (placeholder, rest) = rem.split_at(40);
    let rest = rest.strip_prefix(b" ")?;
    let path = rest.strip_suffix(b"\n").unwrap_or(rest);

    if !placeholder.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mark: u32 = std::str::from_utf8(placeholder).ok()?.parse().ok()?;

    let sha = marks_by_path.get(path)?.get(&mark)?;

    let mut rewritten = Vec::with_capacity(line.len());
    rewritten.extend_from_slice(b"M 160000 ");
    rewritten.extend_from_slice(sha);
    rewritten.push(b' ');
    rewritten.extend_from_slice(path);
    rewritten.push(b'\n');
    Some(rewritten)
}

#[cfg(test)]
mod tests {
    use super::{parse_progress_line, rewrite_gitlink_line, scan_log};
    use crate::FHashMap;
    use std::io::Write as _;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line(b"progress SVN r12 branch refs/heads/master = :7\n"),
            Some((12, "refs/heads/master".into(), 7)),
        );
        assert_eq!(
            parse_progress_line(b"progress SVN r3 branch refs/heads/b = :0 # delete\n"),
            Some((3, "refs/heads/b".into(), 0)),
        );
        assert_eq!(parse_progress_line(b"progress Branch refs/heads/b reloaded\n"), None);
        assert_eq!(parse_progress_line(b"unrelated\n"), None);
    }

    #[test]
    fn test_scan_log_rewinds_on_unknown_mark() {
        let mut log = tempfile::NamedTempFile::new().unwrap();
        write!(
            log,
            "progress SVN r98 branch refs/heads/master = :40\n\
             progress SVN r99 branch refs/heads/master = :42\n",
        )
        .unwrap();

        let scan = scan_log(log.path(), u32::MAX, 40).unwrap();
        assert_eq!(scan.rewind, Some(99));
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.next_rev, 99);
        assert!(scan.truncate_at.is_some());
    }

    #[test]
    fn test_scan_log_respects_cutoff() {
        let mut log = tempfile::NamedTempFile::new().unwrap();
        write!(
            log,
            "progress SVN r5 branch refs/heads/master = :1\n\
             progress SVN r9 branch refs/heads/master = :2\n",
        )
        .unwrap();

        let scan = scan_log(log.path(), 9, 100).unwrap();
        assert_eq!(scan.rewind, None);
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.next_rev, 6);
        assert_eq!(scan.truncate_at, Some(46));
    }

    #[test]
    fn test_rewrite_gitlink_line() {
        let sha = b"8e3dbeb5e19042a45c6e8e1f6f21b6dcfed8ab82";
        let mut marks = FHashMap::<u32, Vec<u8>>::default();
        marks.insert(7, sha.to_vec());
        let mut by_path = FHashMap::default();
        by_path.insert(b"libs/child".to_vec(), marks);

        let line = b"M 160000 0000000000000000000000000000000000000007 libs/child\n";
        let rewritten = rewrite_gitlink_line(line, &by_path).unwrap();
        assert_eq!(
            rewritten,
            b"M 160000 8e3dbeb5e19042a45c6e8e1f6f21b6dcfed8ab82 libs/child\n",
        );

        // Real SHAs and unknown paths pass through untouched.
        let line = b"M 160000 8e3dbeb5e19042a45c6e8e1f6f21b6dcfed8ab82 libs/child\n";
        assert_eq!(rewrite_gitlink_line(line, &by_path), None);
        let line = b"M 160000 0000000000000000000000000000000000000007 other\n";
        assert_eq!(rewrite_gitlink_line(line, &by_path), None);
    }
}
