use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use smallvec::SmallVec;

use super::fast_import::{
    self, ChannelFactory, FastImport, MAX_MARK, NOTES_MARK,
};
use crate::errors::Fatal;
use crate::FHashMap;

/// Options every repository needs at hand while emitting its stream.
#[derive(Clone)]
pub(crate) struct Tuning {
    pub(crate) add_metadata: bool,
    pub(crate) add_metadata_notes: bool,
    pub(crate) commit_interval: u64,
}

/// Author/time/log of the svn revision being replayed.
pub struct CommitMeta {
    pub author: String,
    pub epoch: i64,
    pub log: Vec<u8>,
}

/// Link from a submodule repository up to the repository it is mounted in.
#[derive(Clone)]
pub(crate) struct SuperLink {
    pub(crate) repo: usize,
    pub(crate) path: Vec<u8>,
}

struct RefState {
    name: String,
    /// Parallel arrays: svn revision and the commit mark it got (zero for
    /// deletions). Both strictly increasing in insertion order.
    commits: Vec<u32>,
    marks: Vec<u32>,
    head_tree_sha: Vec<u8>,
    /// Per source ref, the highest source revision already merged.
    merged_revisions: FHashMap<usize, u32>,
    /// Merges to emit when the next commit on this ref opens.
    pending_merges: Vec<(usize, u32)>,
    /// Paths to delete when the next commit opens; the empty path means
    /// "delete everything".
    pending_deletions: Vec<Vec<u8>>,
    /// Submodule mount point -> child repository slab index.
    submodules: BTreeMap<Vec<u8>, usize>,
    note: Vec<u8>,
    last_change_rev: Option<u32>,
    last_submodule_list_change_rev: Option<u32>,
    rewrite_dot_gitmodules: bool,
}

impl RefState {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            commits: Vec::new(),
            marks: Vec::new(),
            head_tree_sha: Vec::new(),
            merged_revisions: FHashMap::default(),
            pending_merges: Vec::new(),
            pending_deletions: Vec::new(),
            submodules: BTreeMap::new(),
            note: Vec::new(),
            last_change_rev: None,
            last_submodule_list_change_rev: None,
            rewrite_dot_gitmodules: false,
        }
    }

    fn exists(&self) -> bool {
        !self.marks.is_empty()
    }
}

struct Transaction {
    svn_prefix: Vec<u8>,
    merges: SmallVec<[u32; 4]>,
    /// Pre-formatted `M <mode> :<mark> <path>` lines.
    modified_files: Vec<u8>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            svn_prefix: Vec::new(),
            merges: SmallVec::new(),
            modified_files: Vec::new(),
        }
    }
}

struct AnnotatedTag {
    supporting_ref: usize,
    svn_prefix: Vec<u8>,
    revnum: u32,
    author: String,
    epoch: i64,
    log: Vec<u8>,
}

/// A commit written to the stream but not yet terminated; the `ls`
/// round-trip that decides whether to keep it is still outstanding.
struct OpenCommit {
    ref_idx: usize,
    mark: u32,
    revnum: u32,
    svn_prefix: Vec<u8>,
    merge_desc: String,
    ls_sent: bool,
}

pub struct Repository {
    pub(crate) name: String,
    git_dir: PathBuf,
    log_path: PathBuf,
    fast_import: FastImport,
    tuning: Tuning,
    refs: Vec<RefState>,
    ref_index: FHashMap<String, usize>,
    /// Dirty refs in the order they were dirtied; commits open from the
    /// back.
    modified_refs: Vec<usize>,
    current: Option<OpenCommit>,
    transactions: FHashMap<usize, Transaction>,
    deleted_branch_cmds: Vec<(usize, Vec<u8>)>,
    reset_branch_cmds: Vec<(usize, Vec<u8>)>,
    annotated_tags: Vec<(String, AnnotatedTag)>,
    commit_count: u64,
    last_commit_mark: u32,
    next_file_mark: u32,
    pub(crate) super_module: Option<SuperLink>,
    pub(crate) has_submodules: bool,
    /// Refs of submodule children dirtied but not yet closed in the
    /// current revision; a nonzero count defers this repository's commits.
    pub(crate) modified_submodule_refs: u32,
    pub(crate) incremental: bool,
}

pub(crate) struct OpenedCommit {
    pub(crate) ref_idx: usize,
    pub(crate) mark: u32,
}

impl Repository {
    pub(crate) fn create(
        name: &str,
        work_dir: &Path,
        factory: &ChannelFactory,
        tuning: Tuning,
    ) -> Result<Self, Fatal> {
        let git_dir = work_dir.join(name);
        let log_path = work_dir.join(fast_import::log_file_name(name));

        if let ChannelFactory::Real { ref git } = *factory {
            if !git_dir.exists() {
                tracing::debug!("creating new repository {name}");
                init_bare_repo(git, &git_dir)?;

                let marks_path = git_dir.join(fast_import::marks_file_name(name));
                std::fs::write(&marks_path, b"").map_err(|e| Fatal::CreateRepo {
                    git_dir: git_dir.clone(),
                    error: e,
                })?;
            }
        }

        Ok(Self {
            name: name.into(),
            fast_import: factory.create(name, &git_dir, &log_path),
            git_dir,
            log_path,
            tuning,
            refs: Vec::new(),
            ref_index: FHashMap::default(),
            modified_refs: Vec::new(),
            current: None,
            transactions: FHashMap::default(),
            deleted_branch_cmds: Vec::new(),
            reset_branch_cmds: Vec::new(),
            annotated_tags: Vec::new(),
            commit_count: 0,
            last_commit_mark: 0,
            next_file_mark: MAX_MARK,
            super_module: None,
            has_submodules: false,
            modified_submodule_refs: 0,
            incremental: false,
        })
    }

    pub(crate) fn marks_path(&self) -> PathBuf {
        self.git_dir.join(fast_import::marks_file_name(&self.name))
    }

    #[inline]
    pub(crate) fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Stable handle for a ref, created on first use. Handles index into
    /// the repository's ref table and never move.
    pub fn demand_ref(&mut self, name: &str) -> usize {
        debug_assert!(name.starts_with("refs/"));
        match self.ref_index.get(name) {
            Some(&ref_idx) => ref_idx,
            None => {
                let ref_idx = self.refs.len();
                self.refs.push(RefState::new(name));
                self.ref_index.insert(name.into(), ref_idx);
                ref_idx
            }
        }
    }

    #[inline]
    pub(crate) fn ref_name(&self, ref_idx: usize) -> &str {
        &self.refs[ref_idx].name
    }

    /// Commit/mark history of a ref, for tests and for the importer's
    /// consistency checks.
    pub fn ref_marks(&self, name: &str) -> Option<(&[u32], &[u32])> {
        let &ref_idx = self.ref_index.get(name)?;
        let ref_state = &self.refs[ref_idx];
        Some((&ref_state.commits, &ref_state.marks))
    }

    /// Highest commit mark allocated so far; elided commits do not give
    /// marks back.
    #[inline]
    pub fn last_commit_mark(&self) -> u32 {
        self.last_commit_mark
    }

    /// Marks the ref dirty for the current revision. Returns `Some(true)`
    /// when it was newly dirtied (the caller propagates that to the
    /// super-module), `None` when discovery is not allowed and the ref is
    /// clean.
    pub(crate) fn modify_ref(&mut self, name: &str, allow_discovery: bool) -> Option<bool> {
        let ref_idx = self.demand_ref(name);
        if self.modified_refs.contains(&ref_idx) {
            return Some(false);
        }
        if !allow_discovery {
            return None;
        }

        tracing::trace!(
            "in git repo {}, marking {name} for modification",
            self.name,
        );
        self.modified_refs.push(ref_idx);
        Some(true)
    }

    #[inline]
    pub(crate) fn has_dirty_refs(&self) -> bool {
        !self.modified_refs.is_empty()
    }

    #[inline]
    pub(crate) fn next_ref_to_open(&self) -> Option<usize> {
        self.modified_refs.last().copied()
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// A repository with submodules must not commit while changes are still
    /// being discovered or while any child ref is still open.
    pub(crate) fn defer_close(&self, discover_changes: bool) -> bool {
        self.has_submodules && (discover_changes || self.modified_submodule_refs != 0)
    }

    fn start_fast_import(&mut self) -> Result<(), Fatal> {
        if self.fast_import.ensure_started()? {
            self.reload_branches()?;
        }
        Ok(())
    }

    /// Re-establish branch tips after the fast-import process (re)starts.
    fn reload_branches(&mut self) -> Result<(), Fatal> {
        let mut buf = Vec::new();
        for ref_state in self.refs.iter() {
            let Some(&last_mark) = ref_state.marks.last() else {
                continue;
            };
            if last_mark == 0 {
                continue;
            }
            buf.extend_from_slice(
                format!(
                    "reset {}\nfrom :{last_mark}\n\nprogress Branch {} reloaded\n",
                    ref_state.name, ref_state.name,
                )
                .as_bytes(),
            );
        }

        if !buf.is_empty() {
            if self.tuning.add_metadata_notes {
                buf.extend_from_slice(
                    format!("reset refs/notes/commits\nfrom :{NOTES_MARK}\n").as_bytes(),
                );
            }
            self.fast_import.write(&buf)?;
        }

        Ok(())
    }

    pub(crate) fn close_fast_import(&mut self) {
        self.fast_import.close();
    }

    fn txn_mut(&mut self, ref_idx: usize) -> &mut Transaction {
        self.transactions.entry(ref_idx).or_insert_with(Transaction::new)
    }

    pub(crate) fn demand_transaction(
        &mut self,
        ref_name: &str,
        svn_prefix: &[u8],
        _revnum: u32,
    ) -> Result<usize, Fatal> {
        let ref_idx = self.demand_ref(ref_name);
        if !self.transactions.contains_key(&ref_idx) {
            if !self.refs[ref_idx].exists() {
                tracing::debug!("creating branch {ref_name} in repository {}", self.name);
            }

            let mut txn = Transaction::new();
            txn.svn_prefix = svn_prefix.to_vec();
            self.transactions.insert(ref_idx, txn);

            self.commit_count += 1;
            if self.commit_count % self.tuning.commit_interval == 0 {
                self.start_fast_import()?;
                self.fast_import.checkpoint()?;
                tracing::debug!("checkpoint, marks file flushed");
            }
        }
        Ok(ref_idx)
    }

    /// Streams one blob and queues the matching `M` line. The blob goes out
    /// immediately; the `M` line waits for the commit to open.
    pub(crate) fn add_file(
        &mut self,
        ref_idx: usize,
        git_path: &[u8],
        mode: u32,
        data: &[u8],
    ) -> Result<(), Fatal> {
        let mark = self.next_file_mark;
        self.next_file_mark -= 1;

        // The two mark counters growing into each other means the run
        // cannot continue safely.
        if mark <= self.last_commit_mark + 1 {
            return Err(Fatal::MarkSpaceExhausted {
                repo: self.name.clone(),
            });
        }

        let txn = self.txn_mut(ref_idx);
        if txn.modified_files.capacity() == 0 {
            txn.modified_files.reserve(2048);
        }
        txn.modified_files
            .extend_from_slice(format!("M {mode:o} :{mark} ").as_bytes());
        txn.modified_files.extend_from_slice(git_path);
        txn.modified_files.push(b'\n');

        self.start_fast_import()?;
        self.fast_import
            .write_no_log(format!("blob\nmark :{mark}\ndata {}\n", data.len()).as_bytes())?;
        self.fast_import.write_no_log(data)?;
        self.fast_import.write_no_log(b"\n")?;

        Ok(())
    }

    /// Gitlink entry for a submodule child, with the child's commit mark
    /// left-padded into the place of the SHA it does not have yet. A fixup
    /// pass resolves these from the marks file after the run.
    pub(crate) fn update_submodule_entry(
        &mut self,
        ref_idx: usize,
        submodule_path: &[u8],
        mark: u32,
    ) {
        let txn = self.txn_mut(ref_idx);
        txn.modified_files.extend_from_slice(b"M 160000 ");
        txn.modified_files
            .extend_from_slice(format!("{mark:040} ").as_bytes());
        txn.modified_files.extend_from_slice(submodule_path);
        txn.modified_files.push(b'\n');
    }

    pub(crate) fn delete_file(&mut self, ref_idx: usize, path: &[u8]) {
        let path = path.strip_suffix(b"/").unwrap_or(path);
        if path.is_empty() && self.has_submodules {
            self.refs[ref_idx].rewrite_dot_gitmodules = true;
        }
        self.refs[ref_idx].pending_deletions.push(path.to_vec());
    }

    pub(crate) fn set_submodule(
        &mut self,
        ref_idx: usize,
        submodule_path: &[u8],
        child_repo: Option<usize>,
        revnum: u32,
    ) -> bool {
        let ref_state = &mut self.refs[ref_idx];
        match child_repo {
            Some(child_repo) => {
                ref_state
                    .submodules
                    .insert(submodule_path.to_vec(), child_repo);
            }
            None => {
                if ref_state.submodules.remove(submodule_path).is_none() {
                    // No submodule there; nothing to record.
                    return false;
                }
            }
        }
        ref_state.last_submodule_list_change_rev = Some(revnum);
        true
    }

    pub(crate) fn ref_needs_gitmodules(&self, ref_idx: usize, revnum: u32) -> bool {
        let ref_state = &self.refs[ref_idx];
        ref_state.last_submodule_list_change_rev == Some(revnum)
            || ref_state.rewrite_dot_gitmodules
    }

    pub(crate) fn submodules_of(&self, ref_idx: usize) -> Vec<(Vec<u8>, usize)> {
        self.refs[ref_idx]
            .submodules
            .iter()
            .map(|(path, &child)| (path.clone(), child))
            .collect()
    }

    /// Records that `src_ref` at `src_rev` is an ancestor of the
    /// destination ref; the merge line is emitted when the destination's
    /// next commit opens, resolving the revision to the closest mark.
    pub fn record_ancestor(&mut self, dst_ref: usize, src_ref_name: &str, src_rev: u32) {
        let src_ref = self.demand_ref(src_ref_name);
        let pending = &mut self.refs[dst_ref].pending_merges;
        match pending.iter_mut().find(|(r, _)| *r == src_ref) {
            Some((_, rev)) => *rev = (*rev).max(src_rev),
            None => pending.push((src_ref, src_rev)),
        }
    }

    /// Notes that files were copied from another branch, turning the copy
    /// into a merge parent of the open transaction.
    pub(crate) fn note_copy_from_branch(
        &mut self,
        dst_ref: usize,
        src_ref_name: &str,
        src_rev: u32,
    ) {
        if self.refs[dst_ref].name == src_ref_name {
            tracing::warn!("cannot merge inside a branch in repository {}", self.name);
            return;
        }

        let src_ref = self.demand_ref(src_ref_name);
        match self.mark_from(src_ref, src_rev) {
            None => {
                tracing::warn!(
                    "{} is copying from branch {src_ref_name} but the latter doesn't exist, \
                     continuing, assuming the files exist in repository {}",
                    self.refs[dst_ref].name,
                    self.name,
                );
            }
            Some((0, _)) => {
                tracing::warn!(
                    "unknown revision r{src_rev}, continuing, assuming the files exist \
                     in repository {}",
                    self.name,
                );
            }
            Some((mark, _)) => {
                let repo_name = self.name.clone();
                let txn = self.txn_mut(dst_ref);
                if txn.merges.contains(&mark) {
                    tracing::debug!("merge point already recorded in repository {}", repo_name);
                } else {
                    tracing::debug!(
                        "adding {src_ref_name}@{src_rev} : {mark} as a merge point \
                         in repository {}",
                        repo_name,
                    );
                    txn.merges.push(mark);
                }
            }
        }
    }

    /// Closest mark at or preceding `revnum` on the ref, together with the
    /// revision it belongs to. `None` when the ref never had any entry.
    fn mark_from(&self, src_ref: usize, revnum: u32) -> Option<(u32, u32)> {
        let ref_state = &self.refs[src_ref];
        let last_rev = *ref_state.commits.last()?;
        if revnum >= last_rev {
            return Some((*ref_state.marks.last().unwrap(), last_rev));
        }

        let pos = ref_state.commits.partition_point(|&c| c <= revnum);
        if pos == 0 {
            tracing::warn!(
                "no mark found for r{revnum} of branch {} in repository {}",
                ref_state.name,
                self.name,
            );
            return Some((0, revnum));
        }

        Some((ref_state.marks[pos - 1], ref_state.commits[pos - 1]))
    }

    /// Creates (or re-points) a branch from another ref. Returns the mark
    /// the branch was reset to, which doubles as the gitlink value when
    /// this repository is a submodule.
    pub(crate) fn create_branch(
        &mut self,
        branch_ref: &str,
        revnum: u32,
        branch_from: &str,
        branch_from_rev: u32,
    ) -> Result<u32, Fatal> {
        debug_assert!(branch_ref.starts_with("refs/"));
        debug_assert!(branch_from.starts_with("refs/"));

        let from_ref = self.demand_ref(branch_from);
        let Some((mark, closest_rev)) = self.mark_from(from_ref, branch_from_rev) else {
            return Err(Fatal::BranchFromMissing {
                repo: self.name.clone(),
                branch: branch_ref.into(),
                branch_from: branch_from.into(),
            });
        };

        let mut desc = format!("from branch {branch_from} at r{branch_from_rev}");
        if closest_rev != branch_from_rev {
            desc.push_str(&format!(" => r{closest_rev}"));
        }

        let reset_to;
        if mark == 0 {
            tracing::warn!(
                "{branch_ref} in repository {} is branching but no exported commits exist \
                 in repository, creating an empty branch",
                self.name,
            );
            reset_to = branch_from.to_string();
            desc.push_str(", deleted/unknown");
        } else {
            reset_to = format!(":{mark}");
        }

        tracing::debug!(
            "creating branch {branch_ref} from {branch_from} (r{branch_from_rev}) \
             in repository {}",
            self.name,
        );

        let branch_idx = self.demand_ref(branch_ref);
        self.refs[branch_idx].note = self.refs[from_ref].note.clone();

        self.reset_branch(branch_idx, revnum, mark, &reset_to, &desc);
        Ok(mark)
    }

    /// Branch deletion; `refs/heads/master` is never actually deleted.
    /// Returns the gitlink mark (zero) unless the deletion was a no-op.
    pub(crate) fn delete_branch(&mut self, branch_ref: &str, revnum: u32) -> Option<u32> {
        debug_assert!(branch_ref.starts_with("refs/"));

        if branch_ref == "refs/heads/master" {
            return None;
        }

        let branch_idx = self.demand_ref(branch_ref);
        self.reset_branch(branch_idx, revnum, 0, &"0".repeat(40), "delete");
        Some(0)
    }

    fn reset_branch(
        &mut self,
        ref_idx: usize,
        revnum: u32,
        mark: u32,
        reset_to: &str,
        comment: &str,
    ) {
        let deleting = mark == 0 && reset_to.bytes().all(|b| b == b'0');

        let ref_state = &mut self.refs[ref_idx];
        let name = ref_state.name.clone();

        let mut cmd = Vec::<u8>::new();
        if ref_state.exists() && ref_state.last_change_rev != Some(revnum) {
            let backup_branch = if deleting && name.starts_with("refs/heads/") {
                format!("refs/tags/backups/{}@{revnum}", &name[11..])
            } else {
                format!("refs/backups/r{revnum}{}", &name[4..])
            };
            tracing::debug!(
                "backing up branch {name} to {backup_branch} in repository {}",
                self.name,
            );
            cmd.extend_from_slice(format!("reset {backup_branch}\nfrom {name}\n\n").as_bytes());
        }

        // A deleted branch gets a mark of zero.
        ref_state.last_change_rev = Some(revnum);
        ref_state.commits.push(revnum);
        ref_state.marks.push(mark);

        cmd.extend_from_slice(
            format!(
                "reset {name}\nfrom {reset_to}\n\n\
                 progress SVN r{revnum} branch {name} = :{mark} # {comment}\n\n",
            )
            .as_bytes(),
        );

        if deleting {
            // A branch can be re-created after a deletion in one revision,
            // but not the other way around: a deletion arriving after a
            // queued reset cancels both.
            if let Some(pos) = self
                .reset_branch_cmds
                .iter()
                .position(|&(r, _)| r == ref_idx)
            {
                self.reset_branch_cmds.remove(pos);
            } else {
                self.deleted_branch_cmds.push((ref_idx, cmd));
            }
        } else {
            // A reset after a queued deletion supersedes it.
            self.deleted_branch_cmds.retain(|&(r, _)| r != ref_idx);
            match self
                .reset_branch_cmds
                .iter_mut()
                .find(|&&mut (r, _)| r == ref_idx)
            {
                Some((_, existing)) => existing.extend_from_slice(&cmd),
                None => self.reset_branch_cmds.push((ref_idx, cmd)),
            }
        }
    }

    /// Flushes queued branch deletions and resets ahead of this revision's
    /// commits.
    pub(crate) fn prepare_commit(&mut self, _revnum: u32) -> Result<(), Fatal> {
        if self.deleted_branch_cmds.is_empty() && self.reset_branch_cmds.is_empty() {
            return Ok(());
        }

        self.start_fast_import()?;
        for (_, cmd) in std::mem::take(&mut self.deleted_branch_cmds) {
            self.fast_import.write(&cmd)?;
        }
        for (_, cmd) in std::mem::take(&mut self.reset_branch_cmds) {
            self.fast_import.write(&cmd)?;
        }
        Ok(())
    }

    /// Opens a commit on the most recently dirtied ref: allocates the mark,
    /// writes the commit header, merges, deletions and queued file
    /// modifications. The commit stays open until `close_commit` so the
    /// `ls` round-trip can still look at its tree.
    pub(crate) fn open_commit(
        &mut self,
        revnum: u32,
        meta: &CommitMeta,
    ) -> Result<Option<OpenedCommit>, Fatal> {
        if self.current.is_some() {
            return Ok(None);
        }
        let Some(&ref_idx) = self.modified_refs.last() else {
            return Ok(None);
        };

        self.start_fast_import()?;

        let mark = self.last_commit_mark + 1;
        if mark + 1 >= self.next_file_mark {
            return Err(Fatal::MarkSpaceExhausted {
                repo: self.name.clone(),
            });
        }
        self.last_commit_mark = mark;

        let txn = self.transactions.remove(&ref_idx).unwrap_or_else(Transaction::new);

        let ref_state = &mut self.refs[ref_idx];
        tracing::trace!(
            "repository {} opening commit in ref {}",
            self.name,
            ref_state.name,
        );

        let parent_mark = ref_state.marks.last().copied().unwrap_or(0);
        if !ref_state.exists() && self.incremental {
            tracing::warn!(
                "branch {} in repository {} doesn't exist at revision {revnum} \
                 -- did you resume from the wrong revision?",
                ref_state.name,
                self.name,
            );
        }

        ref_state.last_change_rev = Some(revnum);
        ref_state.commits.push(revnum);
        ref_state.marks.push(mark);

        let mut message = meta.log.clone();
        if !message.ends_with(b"\n") {
            message.push(b'\n');
        }
        if self.tuning.add_metadata {
            message.push(b'\n');
            message.extend_from_slice(
                format_metadata_message(&txn.svn_prefix, revnum, None).as_bytes(),
            );
        }

        let ref_name = self.refs[ref_idx].name.clone();
        self.fast_import
            .commit(&ref_name, mark, &meta.author, meta.epoch, &message)?;

        let merge_desc = self.write_merges(ref_idx, parent_mark, &txn, &meta.log)?;
        self.write_deletions(ref_idx)?;
        self.fast_import.write(&txn.modified_files)?;

        self.current = Some(OpenCommit {
            ref_idx,
            mark,
            revnum,
            svn_prefix: txn.svn_prefix,
            merge_desc,
            ls_sent: false,
        });

        Ok(Some(OpenedCommit { ref_idx, mark }))
    }

    fn write_merges(
        &mut self,
        ref_idx: usize,
        parent_mark: u32,
        txn: &Transaction,
        log: &[u8],
    ) -> Result<String, Fatal> {
        let mut merge_marks = SmallVec::<[u32; 4]>::new();

        // Merges recorded by revision: resolve each source revision to the
        // closest mark on the source ref.
        let pending = std::mem::take(&mut self.refs[ref_idx].pending_merges);
        for (src_ref, src_rev) in pending {
            let already_merged = self.refs[ref_idx]
                .merged_revisions
                .get(&src_ref)
                .copied()
                .unwrap_or(0);
            if src_rev <= already_merged {
                continue;
            }

            match self.mark_from(src_ref, src_rev) {
                None | Some((0, _)) => {
                    tracing::warn!(
                        "no commit found at or preceding the source of merge r{src_rev} \
                         in git repo {} ref {}",
                        self.name,
                        self.refs[src_ref].name,
                    );
                    continue;
                }
                Some((mark, _)) => merge_marks.push(mark),
            }
            self.refs[ref_idx].merged_revisions.insert(src_ref, src_rev);
        }

        merge_marks.extend_from_slice(&txn.merges);

        // Branches manufactured by cvs2svn record every source revision as
        // a merge; only the newest one is meaningful.
        if merge_marks.len() > 1
            && find_subslice(log, b"This commit was manufactured by cvs2svn").is_some()
        {
            merge_marks.sort_unstable();
            let highest = *merge_marks.last().unwrap();
            tracing::debug!(
                "discarding all but the highest merge point as a workaround for \
                 cvs2svn created branch/tag",
            );
            merge_marks.clear();
            merge_marks.push(highest);
        }

        let mut desc = String::new();
        let mut parents = u32::from(parent_mark != 0);
        for &merge in merge_marks.iter() {
            if merge == parent_mark {
                tracing::debug!(
                    "skipping marking {merge} as a merge point as it matches the parent \
                     in repository {}",
                    self.name,
                );
                continue;
            }

            parents += 1;
            if parents > 16 {
                // git does not allow more than 16 parents per commit.
                tracing::warn!("too many merge parents in repository {}", self.name);
                break;
            }

            self.fast_import.write(format!("merge :{merge}\n").as_bytes())?;
            desc.push_str(&format!(" :{merge}"));
        }

        Ok(desc)
    }

    fn write_deletions(&mut self, ref_idx: usize) -> Result<(), Fatal> {
        let deletions = std::mem::take(&mut self.refs[ref_idx].pending_deletions);
        if deletions.iter().any(|p| p.is_empty()) {
            self.fast_import.write(b"deleteall\n")?;
        } else {
            for path in deletions {
                self.fast_import.file_delete(&path)?;
            }
        }
        Ok(())
    }

    /// Sends the `ls` that reads back the open commit's tree SHA, unless
    /// the close is deferred or the channel cannot answer.
    pub(crate) fn prepare_to_close_commit(&mut self, discover_changes: bool) -> Result<(), Fatal> {
        if self.defer_close(discover_changes) {
            return Ok(());
        }
        let Some(ref mut open) = self.current else {
            return Ok(());
        };
        if open.ls_sent || !self.fast_import.supports_ls() {
            return Ok(());
        }

        open.ls_sent = true;
        self.fast_import.send_ls(b"")
    }

    /// Terminates the open commit: reads the `ls` response, drops the
    /// commit if it did not change the tree, writes the progress line that
    /// the resume machinery depends on, and pops the ref from the dirty
    /// list. Returns true when no dirty refs remain.
    pub(crate) fn close_commit(&mut self, meta: &CommitMeta) -> Result<bool, Fatal> {
        let Some(open) = self.current.take() else {
            return Ok(self.modified_refs.is_empty());
        };

        tracing::trace!(
            "repository {} closing commit in ref {}",
            self.name,
            self.refs[open.ref_idx].name,
        );

        let mut elide_to = None;
        if open.ls_sent {
            // A dead child or an unparseable response is logged and the
            // ref is left in a state where the next commit cannot be
            // mistaken for empty.
            let response = match self.fast_import.read_response() {
                Ok(response) => Some(response),
                Err(e) => {
                    tracing::error!("{e}");
                    None
                }
            };
            match response.as_deref().and_then(fast_import::parse_ls_tree_sha) {
                None => {
                    if let Some(ref response) = response {
                        tracing::error!(
                            "unrecognized response \"{}\" from ls in ref {}",
                            response.escape_ascii(),
                            self.refs[open.ref_idx].name,
                        );
                    }
                    self.refs[open.ref_idx].head_tree_sha.clear();
                }
                Some(new_sha) => {
                    let ref_state = &mut self.refs[open.ref_idx];
                    tracing::trace!("new tree SHA: {}", new_sha.escape_ascii());

                    // A commit that did not change the tree is semantically
                    // empty. The first commit on a ref is always kept.
                    if new_sha == ref_state.head_tree_sha && ref_state.marks.len() >= 2 {
                        tracing::trace!("tree unchanged; resetting ref");
                        ref_state.marks.pop();
                        ref_state.commits.pop();
                        elide_to = Some(*ref_state.marks.last().unwrap());
                    }
                    ref_state.head_tree_sha = new_sha;
                }
            }
        }

        let ref_name = self.refs[open.ref_idx].name.clone();
        self.fast_import.write(
            format!(
                "\nprogress SVN r{} branch {ref_name} = :{}{}{}\n\n",
                open.revnum,
                open.mark,
                if open.merge_desc.is_empty() {
                    ""
                } else {
                    " # merge from"
                },
                open.merge_desc,
            )
            .as_bytes(),
        )?;

        if let Some(previous_mark) = elide_to {
            self.fast_import.reset(&ref_name, previous_mark)?;
        }

        if self.tuning.add_metadata_notes {
            let note = format_metadata_message(&open.svn_prefix, open.revnum, None);
            self.commit_note(open.ref_idx, &meta.author, meta.epoch, note.as_bytes(), false)?;
        }

        if let Some(pos) = self.modified_refs.iter().position(|&r| r == open.ref_idx) {
            self.modified_refs.remove(pos);
        }
        tracing::trace!("{} modified refs remaining", self.modified_refs.len());

        if self.modified_refs.is_empty() {
            self.end_revision();
        }
        Ok(self.modified_refs.is_empty())
    }

    /// File marks never outlive a revision.
    pub(crate) fn end_revision(&mut self) {
        self.next_file_mark = MAX_MARK;
        self.transactions.clear();
        for ref_state in self.refs.iter_mut() {
            ref_state.rewrite_dot_gitmodules = false;
        }
    }

    fn commit_note(
        &mut self,
        ref_idx: usize,
        author: &str,
        epoch: i64,
        note_text: &[u8],
        append: bool,
    ) -> Result<(), Fatal> {
        let ref_name = self.refs[ref_idx].name.clone();

        let mut text = note_text.to_vec();
        let mut message = format!("Adding Git note for current {ref_name}\n");
        if append && !self.refs[ref_idx].note.is_empty() {
            let mut appended = self.refs[ref_idx].note.clone();
            appended.extend_from_slice(note_text);
            text = appended;
            message = format!("Appending Git note for current {ref_name}\n");
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(b"commit refs/notes/commits\n");
        buf.extend_from_slice(format!("mark :{NOTES_MARK}\n").as_bytes());
        buf.extend_from_slice(format!("committer {author} {epoch} +0000\n").as_bytes());
        buf.extend_from_slice(format!("data {}\n", message.len()).as_bytes());
        buf.extend_from_slice(message.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(format!("N inline {ref_name}\n").as_bytes());
        buf.extend_from_slice(format!("data {}\n", text.len()).as_bytes());
        buf.extend_from_slice(&text);
        buf.push(b'\n');
        self.fast_import.write(&buf)?;

        self.refs[ref_idx].note = text;
        Ok(())
    }

    pub(crate) fn create_annotated_tag(
        &mut self,
        tag_ref: &str,
        svn_prefix: &[u8],
        revnum: u32,
        author: &str,
        epoch: i64,
        log: &[u8],
    ) {
        let tag_name = tag_ref.strip_prefix("refs/tags/").unwrap_or(tag_ref);
        let supporting_ref = self.demand_ref(tag_ref);

        let tag = AnnotatedTag {
            supporting_ref,
            svn_prefix: svn_prefix.to_vec(),
            revnum,
            author: author.into(),
            epoch,
            log: log.to_vec(),
        };

        match self
            .annotated_tags
            .iter_mut()
            .find(|(name, _)| name == tag_name)
        {
            Some((_, existing)) => {
                tracing::debug!(
                    "re-creating annotated tag {tag_name} in repository {}",
                    self.name,
                );
                *existing = tag;
            }
            None => {
                tracing::debug!(
                    "creating annotated tag {tag_name} ({tag_ref}) in repository {}",
                    self.name,
                );
                self.annotated_tags.push((tag_name.into(), tag));
            }
        }
    }

    /// Emits all accumulated annotated tags. Called once at the end of the
    /// import.
    pub(crate) fn finalize_tags(&mut self) -> Result<(), Fatal> {
        if self.annotated_tags.is_empty() {
            return Ok(());
        }

        tracing::debug!("finalising tags for {}", self.name);
        self.start_fast_import()?;

        for (tag_name, tag) in std::mem::take(&mut self.annotated_tags) {
            let supporting_ref_name = self.refs[tag.supporting_ref].name.clone();

            let mut message = tag.log.clone();
            if !message.ends_with(b"\n") {
                message.push(b'\n');
            }
            if self.tuning.add_metadata {
                message.push(b'\n');
                message.extend_from_slice(
                    format_metadata_message(&tag.svn_prefix, tag.revnum, Some(&tag_name))
                        .as_bytes(),
                );
            }

            let mut buf = Vec::new();
            buf.extend_from_slice(
                format!(
                    "progress Creating annotated tag {tag_name} from ref {supporting_ref_name}\n",
                )
                .as_bytes(),
            );
            buf.extend_from_slice(format!("tag {tag_name}\n").as_bytes());
            buf.extend_from_slice(format!("from {supporting_ref_name}\n").as_bytes());
            buf.extend_from_slice(
                format!("tagger {} {} +0000\n", tag.author, tag.epoch).as_bytes(),
            );
            buf.extend_from_slice(format!("data {}\n", message.len()).as_bytes());
            buf.extend_from_slice(&message);
            buf.push(b'\n');
            self.fast_import.write(&buf)?;

            // There is no way to attach a note to the tag itself with
            // fast-import; it goes on the tip of the supporting ref.
            if self.tuning.add_metadata_notes {
                let note = format_metadata_message(&tag.svn_prefix, tag.revnum, Some(&tag_name));
                self.commit_note(
                    tag.supporting_ref,
                    &tag.author,
                    tag.epoch,
                    note.as_bytes(),
                    true,
                )?;
            }
        }

        Ok(())
    }

    /// Seeds ref state from one parsed resume log line.
    pub(crate) fn seed_ref_mark(&mut self, branch: &str, revnum: u32, mark: u32) {
        if self.last_commit_mark < mark {
            self.last_commit_mark = mark;
        }

        let ref_idx = self.demand_ref(branch);
        let ref_state = &mut self.refs[ref_idx];
        if !ref_state.exists() || mark == 0 {
            ref_state.last_change_rev = Some(revnum);
        }
        ref_state.commits.push(revnum);
        ref_state.marks.push(mark);
    }
}

pub(crate) fn format_metadata_message(svn_prefix: &[u8], revnum: u32, tag: Option<&str>) -> String {
    let mut msg = format!(
        "svn path={}; revision={revnum}",
        String::from_utf8_lossy(svn_prefix),
    );
    if let Some(tag) = tag {
        msg.push_str(&format!("; tag={tag}"));
    }
    msg.push('\n');
    msg
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn init_bare_repo(git: &Path, git_dir: &Path) -> Result<(), Fatal> {
    std::fs::create_dir_all(git_dir).map_err(|e| Fatal::CreateRepo {
        git_dir: git_dir.to_path_buf(),
        error: e,
    })?;

    let status = std::process::Command::new(git)
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .current_dir(git_dir)
        .status()
        .map_err(|e| Fatal::CreateRepo {
            git_dir: git_dir.to_path_buf(),
            error: e,
        })?;

    if !status.success() {
        return Err(Fatal::CreateRepo {
            git_dir: git_dir.to_path_buf(),
            error: std::io::Error::other(format!("git init finished with {status}")),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CommitMeta, Repository, Tuning};
    use crate::git::fast_import::{ChannelFactory, SinkRegistry, MAX_MARK};

    fn sink_repo() -> (Repository, crate::git::SinkHandle) {
        let registry = SinkRegistry::new();
        let handle = registry.handle("repo");
        let repo = Repository::create(
            "repo",
            std::path::Path::new("."),
            &ChannelFactory::Sink(registry),
            Tuning {
                add_metadata: false,
                add_metadata_notes: false,
                commit_interval: 10000,
            },
        )
        .map_err(|e| e.to_string())
        .unwrap();
        (repo, handle)
    }

    fn meta(log: &str) -> CommitMeta {
        CommitMeta {
            author: "User <user@example.org>".into(),
            epoch: 1000,
            log: log.as_bytes().to_vec(),
        }
    }

    fn open_and_close(repo: &mut Repository, revnum: u32, meta: &CommitMeta) -> u32 {
        let opened = repo.open_commit(revnum, meta).unwrap().unwrap();
        repo.prepare_to_close_commit(false).unwrap();
        repo.close_commit(meta).unwrap();
        opened.mark
    }

    #[test]
    fn test_simple_commit_stream() {
        let (mut repo, handle) = sink_repo();

        let ref_idx = repo
            .demand_transaction("refs/heads/master", b"trunk", 1)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(ref_idx, b"a.txt", 0o100644, b"hi\n").unwrap();

        assert_eq!(open_and_close(&mut repo, 1, &meta("first\n")), 1);

        let output = handle.output();
        let expected = b"blob\nmark :1048574\ndata 3\nhi\n\n\
            commit refs/heads/master\nmark :1\n\
            committer User <user@example.org> 1000 +0000\n\
            data 6\nfirst\n\n\
            M 100644 :1048574 a.txt\n\n\
            progress SVN r1 branch refs/heads/master = :1\n\n";
        assert_eq!(
            String::from_utf8_lossy(&output),
            String::from_utf8_lossy(expected),
        );

        let (commits, marks) = repo.ref_marks("refs/heads/master").unwrap();
        assert_eq!(commits, [1]);
        assert_eq!(marks, [1]);
    }

    #[test]
    fn test_mark_sequences_stay_monotonic() {
        let (mut repo, _handle) = sink_repo();

        for rev in 1..=5 {
            let ref_idx = repo
                .demand_transaction("refs/heads/master", b"trunk", rev)
                .unwrap();
            let _ = repo.modify_ref("refs/heads/master", true);
            repo.add_file(ref_idx, b"f", 0o100644, b"data").unwrap();
            assert_eq!(open_and_close(&mut repo, rev, &meta("m")), rev);
            // File marks are reset between revisions.
            assert_eq!(repo.next_file_mark, MAX_MARK);
        }

        let (commits, marks) = repo.ref_marks("refs/heads/master").unwrap();
        assert!(commits.windows(2).all(|w| w[0] < w[1]));
        assert!(marks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(marks, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty_commit_elided_via_ls() {
        let (mut repo, handle) = sink_repo();
        let sha = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

        // First commit establishes the tree SHA; it is never elided.
        let ref_idx = repo
            .demand_transaction("refs/heads/master", b"trunk", 1)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(ref_idx, b"a", 0o100644, b"x").unwrap();
        handle.push_ls_response(format!("040000 tree {sha}\t\"\""));
        open_and_close(&mut repo, 1, &meta("one"));

        // Second commit resolves to the same tree: elided.
        repo.demand_transaction("refs/heads/master", b"trunk", 2)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        handle.push_ls_response(format!("040000 tree {sha}\t\"\""));
        open_and_close(&mut repo, 2, &meta("two"));

        let (commits, marks) = repo.ref_marks("refs/heads/master").unwrap();
        assert_eq!(commits, [1]);
        assert_eq!(marks, [1]);
        // The commit counter is not rolled back.
        assert_eq!(repo.last_commit_mark(), 2);

        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert!(output.contains("reset refs/heads/master\nfrom :1\n\n"));
    }

    #[test]
    fn test_delete_then_create_cancels() {
        let (mut repo, handle) = sink_repo();

        // Give the source branch a commit to branch from.
        let ref_idx = repo
            .demand_transaction("refs/heads/master", b"trunk", 1)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(ref_idx, b"a", 0o100644, b"x").unwrap();
        open_and_close(&mut repo, 1, &meta("one"));

        // Same revision: create b, delete b. Both must vanish.
        repo.create_branch("refs/heads/b", 2, "refs/heads/master", 1)
            .unwrap();
        assert_eq!(repo.delete_branch("refs/heads/b", 2), Some(0));
        repo.prepare_commit(2).unwrap();

        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert!(!output.contains("reset refs/heads/b\n"));
        assert!(!output.contains("backups"));
    }

    #[test]
    fn test_delete_then_recreate_keeps_reset() {
        let (mut repo, handle) = sink_repo();

        let ref_idx = repo
            .demand_transaction("refs/heads/master", b"trunk", 1)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(ref_idx, b"a", 0o100644, b"x").unwrap();
        open_and_close(&mut repo, 1, &meta("one"));

        repo.create_branch("refs/heads/b", 2, "refs/heads/master", 1)
            .unwrap();
        repo.prepare_commit(2).unwrap();

        // r3 deletes then re-creates: only the reset survives.
        let _ = repo.delete_branch("refs/heads/b", 3);
        repo.create_branch("refs/heads/b", 3, "refs/heads/master", 1)
            .unwrap();
        repo.prepare_commit(3).unwrap();

        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert!(!output.contains("from 0000000000000000000000000000000000000000"));
        // One reset from r2, one from r3.
        assert_eq!(output.matches("reset refs/heads/b\nfrom :1\n").count(), 2);
    }

    #[test]
    fn test_deleting_master_is_a_no_op() {
        let (mut repo, handle) = sink_repo();
        assert_eq!(repo.delete_branch("refs/heads/master", 3), None);
        repo.prepare_commit(3).unwrap();
        assert_eq!(handle.output(), b"");
    }

    #[test]
    fn test_backup_ref_on_reset_and_delete() {
        let (mut repo, handle) = sink_repo();

        let ref_idx = repo
            .demand_transaction("refs/heads/b", b"branches/b", 1)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/b", true);
        repo.add_file(ref_idx, b"a", 0o100644, b"x").unwrap();
        open_and_close(&mut repo, 1, &meta("one"));

        let ref_idx = repo
            .demand_transaction("refs/heads/master", b"trunk", 2)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(ref_idx, b"a", 0o100644, b"y").unwrap();
        open_and_close(&mut repo, 2, &meta("two"));

        // Re-pointing an existing branch backs it up under refs/backups.
        repo.create_branch("refs/heads/b", 3, "refs/heads/master", 2)
            .unwrap();
        repo.prepare_commit(3).unwrap();
        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert!(output.contains("reset refs/backups/r3/heads/b\nfrom refs/heads/b\n"));

        // Deleting it backs it up under refs/tags/backups.
        let _ = repo.delete_branch("refs/heads/b", 4);
        repo.prepare_commit(4).unwrap();
        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert!(output.contains("reset refs/tags/backups/b@4\nfrom refs/heads/b\n"));
    }

    #[test]
    fn test_cvs2svn_merge_pruning() {
        let (mut repo, handle) = sink_repo();

        // Build some history on two source branches.
        for rev in 1..=3 {
            let ref_idx = repo
                .demand_transaction("refs/heads/master", b"trunk", rev)
                .unwrap();
            let _ = repo.modify_ref("refs/heads/master", true);
            repo.add_file(ref_idx, b"f", 0o100644, b"data").unwrap();
            open_and_close(&mut repo, rev, &meta("m"));
        }

        let dst = repo
            .demand_transaction("refs/heads/b", b"branches/b", 4)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/b", true);
        repo.add_file(dst, b"f", 0o100644, b"data").unwrap();
        for rev in 1..=3 {
            repo.note_copy_from_branch(dst, "refs/heads/master", rev);
        }

        let cvs_meta = meta("This commit was manufactured by cvs2svn\n");
        open_and_close(&mut repo, 4, &cvs_meta);

        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert_eq!(output.matches("merge :").count(), 1);
        assert!(output.contains("merge :3\n"));
    }

    #[test]
    fn test_merge_parent_cap() {
        let (mut repo, handle) = sink_repo();

        // 20 one-commit source branches.
        for i in 0..20 {
            let name = format!("refs/heads/src{i}");
            let ref_idx = repo.demand_transaction(&name, b"branches", 1).unwrap();
            let _ = repo.modify_ref(&name, true);
            repo.add_file(ref_idx, b"f", 0o100644, b"data").unwrap();
            open_and_close(&mut repo, 1, &meta("m"));
        }

        let dst = repo
            .demand_transaction("refs/heads/b", b"branches/b", 2)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/b", true);
        repo.add_file(dst, b"f", 0o100644, b"data").unwrap();
        for i in 0..20 {
            repo.note_copy_from_branch(dst, &format!("refs/heads/src{i}"), 1);
        }
        open_and_close(&mut repo, 2, &meta("m"));

        // No first parent (new branch), so 16 merge parents fit.
        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert_eq!(output.matches("merge :").count(), 16);
    }

    #[test]
    fn test_pending_merge_resolution() {
        let (mut repo, handle) = sink_repo();

        for rev in [1, 3, 5] {
            let ref_idx = repo
                .demand_transaction("refs/heads/src", b"branches/src", rev)
                .unwrap();
            let _ = repo.modify_ref("refs/heads/src", true);
            repo.add_file(ref_idx, b"f", 0o100644, b"data").unwrap();
            open_and_close(&mut repo, rev, &meta("m"));
        }

        let dst = repo
            .demand_transaction("refs/heads/master", b"trunk", 6)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(dst, b"f", 0o100644, b"data").unwrap();
        // r4 resolves to the commit at r3 (mark 2).
        repo.record_ancestor(dst, "refs/heads/src", 4);
        open_and_close(&mut repo, 6, &meta("m"));

        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert!(output.contains("merge :2\n"));

        // Merging an older revision again is a no-op.
        let dst = repo
            .demand_transaction("refs/heads/master", b"trunk", 7)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.add_file(dst, b"f", 0o100644, b"data").unwrap();
        repo.record_ancestor(dst, "refs/heads/src", 2);
        open_and_close(&mut repo, 7, &meta("m"));

        let output = String::from_utf8_lossy(&handle.output()).into_owned();
        assert_eq!(output.matches("merge :").count(), 1);
    }

    #[test]
    fn test_gitmodules_flag_on_root_deletion() {
        let (mut repo, _handle) = sink_repo();
        repo.has_submodules = true;

        let ref_idx = repo
            .demand_transaction("refs/heads/master", b"trunk", 1)
            .unwrap();
        let _ = repo.modify_ref("refs/heads/master", true);
        repo.delete_file(ref_idx, b"");
        assert!(repo.ref_needs_gitmodules(ref_idx, 1));
    }
}
