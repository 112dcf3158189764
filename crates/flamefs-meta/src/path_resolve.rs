//! Path resolution.
//!
//! Walks directory entries component by component, following symlinks up to
//! the configured bounds and checking traversal permission on every
//! directory along the way. All reads are snapshot reads; operations add
//! conflict points explicitly for the records they depend on.

use flamefs_kv::ReadOnlyTransaction;
use flamefs_proto::common::UserInfo;
use flamefs_proto::meta::{Acl, InodeData};
use flamefs_types::{make_error, make_error_msg, InodeId, MetaCode, Result};

use crate::dir_entry::DirEntry;
use crate::inode::{check_permission, AccessType, Inode};

/// Outcome of resolving a path: the directory that holds (or would hold)
/// the leaf, and the leaf entry when it exists.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    pub parent_id: InodeId,
    pub parent_acl: Acl,
    pub dir_entry: Option<DirEntry>,
    /// Leaf name derived from the path (also set when the entry is absent).
    pub leaf_name: String,
}

/// Outcome of resolving a path for recursive mkdir: the deepest existing
/// directory plus the components still missing below it.
#[derive(Debug, Clone)]
pub struct ResolveRangeResult {
    pub base_id: InodeId,
    pub base_acl: Acl,
    pub missing: Vec<String>,
}

pub struct PathResolver<'a, T: ReadOnlyTransaction + ?Sized> {
    txn: &'a T,
    user: &'a UserInfo,
    max_symlink_count: usize,
    max_symlink_depth: usize,
    symlinks_followed: usize,
}

impl<'a, T: ReadOnlyTransaction + ?Sized> PathResolver<'a, T> {
    pub fn new(
        txn: &'a T,
        user: &'a UserInfo,
        max_symlink_count: usize,
        max_symlink_depth: usize,
    ) -> Self {
        Self {
            txn,
            user,
            max_symlink_count,
            max_symlink_depth,
            symlinks_followed: 0,
        }
    }

    /// Resolve `path` relative to `parent`. With `follow_last_symlink`, a
    /// symlink at the leaf is chased like any intermediate one.
    pub async fn resolve(
        &mut self,
        parent: InodeId,
        path: &str,
        follow_last_symlink: bool,
    ) -> Result<ResolveResult> {
        self.resolve_at_depth(parent, path, follow_last_symlink, 0).await
    }

    async fn resolve_at_depth(
        &mut self,
        parent: InodeId,
        path: &str,
        follow_last_symlink: bool,
        depth: usize,
    ) -> Result<ResolveResult> {
        if depth > self.max_symlink_depth {
            return make_error(MetaCode::TOO_MANY_SYMLINKS);
        }

        let (start, rest) = if path.starts_with('/') {
            (InodeId::ROOT, path.trim_start_matches('/'))
        } else {
            (parent, path)
        };
        let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty() && *c != ".").collect();

        let mut current = start;
        let mut current_acl = self.load_dir_acl(current).await?;

        if components.is_empty() {
            return Ok(ResolveResult {
                parent_id: current,
                parent_acl: current_acl,
                dir_entry: None,
                leaf_name: String::new(),
            });
        }

        for (i, component) in components.iter().enumerate() {
            let is_leaf = i + 1 == components.len();

            // Traversing a directory requires exec permission on it.
            check_permission(&current_acl, self.user, AccessType::Exec)?;

            let entry = DirEntry::snapshot_load(self.txn, current, component).await?;
            let Some(entry) = entry else {
                if is_leaf {
                    return Ok(ResolveResult {
                        parent_id: current,
                        parent_acl: current_acl,
                        dir_entry: None,
                        leaf_name: component.to_string(),
                    });
                }
                return make_error_msg(
                    MetaCode::NOT_FOUND,
                    format!("path component {:?} not found", component),
                );
            };

            if entry.is_symlink() && (!is_leaf || follow_last_symlink) {
                self.symlinks_followed += 1;
                if self.symlinks_followed > self.max_symlink_count {
                    return make_error(MetaCode::TOO_MANY_SYMLINKS);
                }
                let inode = entry.snapshot_load_inode(self.txn).await?;
                let target = inode.record.symlink_target().unwrap_or("").to_string();
                let remainder = components[i + 1..].join("/");
                let chased = if remainder.is_empty() {
                    target
                } else {
                    format!("{}/{}", target, remainder)
                };
                return Box::pin(self.resolve_at_depth(
                    current,
                    &chased,
                    follow_last_symlink,
                    depth + 1,
                ))
                .await;
            }

            if is_leaf {
                return Ok(ResolveResult {
                    parent_id: current,
                    parent_acl: current_acl,
                    dir_entry: Some(entry),
                    leaf_name: component.to_string(),
                });
            }

            if !entry.is_directory() {
                return make_error_msg(
                    MetaCode::NOT_DIRECTORY,
                    format!("{:?} is not a directory", component),
                );
            }
            // The cached directory ACL saves an inode load per component.
            current_acl = match entry.record.dir_acl {
                Some(acl) => acl,
                None => self.load_dir_acl(entry.inode_id()).await?,
            };
            current = entry.inode_id();
        }

        unreachable!("loop returns at the leaf");
    }

    /// Resolve as deep as possible for mkdir: returns the deepest existing
    /// directory and the missing tail components.
    pub async fn resolve_range(
        &mut self,
        parent: InodeId,
        path: &str,
    ) -> Result<ResolveRangeResult> {
        let (start, rest) = if path.starts_with('/') {
            (InodeId::ROOT, path.trim_start_matches('/'))
        } else {
            (parent, path)
        };
        let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty() && *c != ".").collect();

        let mut current = start;
        let mut current_acl = self.load_dir_acl(current).await?;
        let mut missing = Vec::new();

        for component in components.iter() {
            if !missing.is_empty() {
                missing.push(component.to_string());
                continue;
            }
            check_permission(&current_acl, self.user, AccessType::Exec)?;
            match DirEntry::snapshot_load(self.txn, current, component).await? {
                Some(entry) if entry.is_directory() => {
                    current_acl = match entry.record.dir_acl {
                        Some(acl) => acl,
                        None => self.load_dir_acl(entry.inode_id()).await?,
                    };
                    current = entry.inode_id();
                }
                Some(_) => {
                    return make_error_msg(
                        MetaCode::NOT_DIRECTORY,
                        format!("{:?} exists and is not a directory", component),
                    );
                }
                None => missing.push(component.to_string()),
            }
        }

        Ok(ResolveRangeResult {
            base_id: current,
            base_acl: current_acl,
            missing,
        })
    }

    /// Canonical absolute path of a directory, rebuilt from parent links.
    pub async fn real_path_of_dir(&self, dir: InodeId) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        let mut current = dir;
        // Bounded walk; a cycle in parent links is corruption.
        for _ in 0..256 {
            if current == InodeId::ROOT {
                parts.reverse();
                return Ok(format!("/{}", parts.join("/")));
            }
            let inode = Inode::snapshot_load(self.txn, current)
                .await?
                .ok_or_else(|| {
                    flamefs_types::Status::with_message(
                        MetaCode::NOT_FOUND,
                        format!("inode {} not found", current),
                    )
                })?;
            match &inode.record.data {
                InodeData::Directory { parent, name, .. } => {
                    parts.push(name.clone());
                    current = *parent;
                }
                _ => {
                    return make_error_msg(MetaCode::NOT_DIRECTORY, "real path of non-directory")
                }
            }
        }
        make_error_msg(MetaCode::INCONSISTENT, "parent links do not reach root")
    }

    async fn load_dir_acl(&self, dir: InodeId) -> Result<Acl> {
        let inode = Inode::snapshot_load(self.txn, dir).await?.ok_or_else(|| {
            flamefs_types::Status::with_message(
                MetaCode::NOT_FOUND,
                format!("directory {} not found", dir),
            )
        })?;
        if !inode.is_directory() {
            return make_error_msg(MetaCode::NOT_DIRECTORY, "resolution base is not a directory");
        }
        Ok(inode.acl())
    }
}
