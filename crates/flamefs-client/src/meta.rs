//! Metadata client wrapper.
//!
//! Stamps each operation with the client id and a request uuid, then
//! retries transparently on transient errors. The uuid stays fixed across
//! retries, so a `MaybeCommitted` replay hits the server's idempotency
//! record instead of re-applying.

use std::sync::Arc;

use flamefs_meta::MetaService;
use flamefs_proto::common::{ReqBase, UserInfo};
use flamefs_proto::meta::*;
use flamefs_types::{
    status_code_t, InodeId, MetaCode, RPCCode, Status, TransactionCode, Uuid,
};

use crate::config::MetaClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::retry::ExponentialBackoff;

fn retryable(code: status_code_t) -> bool {
    matches!(
        code,
        MetaCode::BUSY
            | MetaCode::RETRYABLE
            | MetaCode::OPERATION_TIMEOUT
            | TransactionCode::CONFLICT
            | TransactionCode::MAYBE_COMMITTED
            | TransactionCode::THROTTLED
            | TransactionCode::TOO_OLD
            | RPCCode::TIMEOUT
            | RPCCode::SEND_FAILED
            | RPCCode::CONNECT_FAILED
    )
}

pub struct MetaClient {
    service: Arc<dyn MetaService>,
    config: MetaClientConfig,
    client_id: Uuid,
    user: UserInfo,
}

impl MetaClient {
    pub fn new(service: Arc<dyn MetaService>, config: MetaClientConfig, user: UserInfo) -> Self {
        Self {
            service,
            config,
            client_id: Uuid::generate(),
            user,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn base(&self) -> ReqBase {
        ReqBase {
            user: self.user.clone(),
            client: self.client_id,
            request_uuid: Uuid::generate(),
            forward: false,
        }
    }

    /// Retry `call` until it succeeds, fails permanently or the budget runs
    /// out. `call` must reuse the same request (same uuid) every attempt.
    async fn retry<T, F, Fut>(&self, mut call: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = flamefs_types::Result<T>>,
    {
        let mut backoff = ExponentialBackoff::new(
            self.config.retry_init_wait,
            self.config.retry_max_wait,
            self.config.retry_total,
        );
        let mut last: Status;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(status) if retryable(status.code()) => last = status,
                Err(status) => return Err(ClientError::Status(status)),
            }
            // Owner rediscovery and conflicts retry promptly; everything
            // else backs off.
            let wait = if last.code() == MetaCode::BUSY {
                backoff.fast_wait()
            } else {
                backoff.next_wait()
            };
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => {
                    return Err(ClientError::RetryExhausted {
                        attempts: backoff.attempts(),
                        last,
                    })
                }
            }
        }
    }

    pub async fn stat(&self, path: PathAt, follow: bool) -> ClientResult<Inode> {
        let req = StatReq {
            base: self.base(),
            path,
            follow,
        };
        let rsp = self
            .retry(|| self.service.stat(req.clone()))
            .await?;
        Ok(rsp.inode)
    }

    pub async fn create(
        &self,
        path: PathAt,
        perm: u32,
        flags: OpenFlags,
        session: Option<Uuid>,
    ) -> ClientResult<CreateRsp> {
        let req = CreateReq {
            base: self.base(),
            path,
            perm,
            flags,
            layout: None,
            session,
        };
        self.retry(|| self.service.create(req.clone())).await
    }

    pub async fn open(
        &self,
        path: PathAt,
        flags: OpenFlags,
        session: Option<Uuid>,
    ) -> ClientResult<OpenRsp> {
        let req = OpenReq {
            base: self.base(),
            path,
            flags,
            session,
        };
        self.retry(|| self.service.open(req.clone())).await
    }

    pub async fn close(
        &self,
        inode: InodeId,
        session: Uuid,
        length: Option<u64>,
    ) -> ClientResult<Inode> {
        let req = CloseReq {
            base: self.base(),
            inode,
            session,
            length,
            update_mtime: true,
        };
        let rsp = self.retry(|| self.service.close(req.clone())).await?;
        Ok(rsp.inode)
    }

    pub async fn sync(&self, inode: InodeId, length: Option<u64>) -> ClientResult<Inode> {
        let req = SyncReq {
            base: self.base(),
            inode,
            length,
            update_mtime: true,
        };
        let rsp = self.retry(|| self.service.sync(req.clone())).await?;
        Ok(rsp.inode)
    }

    pub async fn mkdir(&self, path: PathAt, perm: u32, recursive: bool) -> ClientResult<Inode> {
        let req = MkdirReq {
            base: self.base(),
            path,
            perm,
            recursive,
            layout: None,
        };
        let rsp = self.retry(|| self.service.mkdir(req.clone())).await?;
        Ok(rsp.inode)
    }

    pub async fn list(&self, path: PathAt, prev: String, limit: i32) -> ClientResult<ListRsp> {
        let req = ListReq {
            base: self.base(),
            path,
            prev,
            limit,
            status: false,
        };
        self.retry(|| self.service.list(req.clone())).await
    }

    pub async fn remove(&self, path: PathAt, recursive: bool) -> ClientResult<()> {
        let req = RemoveReq {
            base: self.base(),
            path,
            recursive,
            expect_directory: None,
        };
        self.retry(|| self.service.remove(req.clone())).await?;
        Ok(())
    }

    pub async fn rename(&self, src: PathAt, dest: PathAt) -> ClientResult<Option<Inode>> {
        let req = RenameReq {
            base: self.base(),
            src,
            dest,
        };
        let rsp = self.retry(|| self.service.rename(req.clone())).await?;
        Ok(rsp.inode)
    }

    pub async fn symlink(&self, path: PathAt, target: String) -> ClientResult<Inode> {
        let req = SymlinkReq {
            base: self.base(),
            path,
            target,
        };
        let rsp = self.retry(|| self.service.symlink(req.clone())).await?;
        Ok(rsp.inode)
    }

    pub async fn truncate(&self, inode: InodeId, length: u64) -> ClientResult<TruncateRsp> {
        // One uuid across the whole multi-pass truncate keeps the chunk
        // removal idempotent.
        let req = TruncateReq {
            base: self.base(),
            inode,
            length,
        };
        loop {
            let rsp = self.retry(|| self.service.truncate(req.clone())).await?;
            if rsp.finished {
                return Ok(rsp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Service that fails the first N calls with a retryable status.
    struct Flaky {
        inner: FlakyState,
    }

    struct FlakyState {
        failures_left: AtomicU32,
        calls: AtomicU32,
        seen_uuids: parking_lot::Mutex<Vec<Uuid>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                inner: FlakyState {
                    failures_left: AtomicU32::new(failures),
                    calls: AtomicU32::new(0),
                    seen_uuids: parking_lot::Mutex::new(Vec::new()),
                },
            }
        }

        fn note(&self, uuid: Uuid) -> flamefs_types::Result<()> {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.seen_uuids.lock().push(uuid);
            if self
                .inner
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Status::new(MetaCode::BUSY));
            }
            Ok(())
        }

        fn dummy_inode() -> Inode {
            Inode {
                id: InodeId(1),
                acl: Acl::default(),
                nlink: 1,
                atime_ns: 0,
                mtime_ns: 0,
                ctime_ns: 0,
                data: InodeData::Symlink {
                    target: "t".into(),
                },
            }
        }
    }

    #[async_trait]
    impl MetaService for Flaky {
        async fn stat(&self, req: StatReq) -> flamefs_types::Result<StatRsp> {
            self.note(req.base.request_uuid)?;
            Ok(StatRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn batch_stat(&self, _req: BatchStatReq) -> flamefs_types::Result<BatchStatRsp> {
            Ok(BatchStatRsp { inodes: vec![] })
        }
        async fn create(&self, req: CreateReq) -> flamefs_types::Result<CreateRsp> {
            self.note(req.base.request_uuid)?;
            Ok(CreateRsp {
                inode: Self::dummy_inode(),
                need_truncate: false,
            })
        }
        async fn open(&self, _req: OpenReq) -> flamefs_types::Result<OpenRsp> {
            Ok(OpenRsp {
                inode: Self::dummy_inode(),
                need_truncate: false,
            })
        }
        async fn close(&self, _req: CloseReq) -> flamefs_types::Result<CloseRsp> {
            Ok(CloseRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn sync(&self, _req: SyncReq) -> flamefs_types::Result<SyncRsp> {
            Ok(SyncRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn mkdir(&self, _req: MkdirReq) -> flamefs_types::Result<MkdirRsp> {
            Ok(MkdirRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn list(&self, _req: ListReq) -> flamefs_types::Result<ListRsp> {
            Ok(ListRsp {
                entries: vec![],
                inodes: vec![],
                more: false,
            })
        }
        async fn remove(&self, _req: RemoveReq) -> flamefs_types::Result<RemoveRsp> {
            Err(Status::new(MetaCode::NO_PERMISSION))
        }
        async fn rename(&self, _req: RenameReq) -> flamefs_types::Result<RenameRsp> {
            Ok(RenameRsp { inode: None })
        }
        async fn symlink(&self, _req: SymlinkReq) -> flamefs_types::Result<SymlinkRsp> {
            Ok(SymlinkRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn hard_link(&self, _req: HardLinkReq) -> flamefs_types::Result<HardLinkRsp> {
            Ok(HardLinkRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn set_attr(&self, _req: SetAttrReq) -> flamefs_types::Result<SetAttrRsp> {
            Ok(SetAttrRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn truncate(&self, _req: TruncateReq) -> flamefs_types::Result<TruncateRsp> {
            Ok(TruncateRsp {
                inode: Self::dummy_inode(),
                chunks_removed: 0,
                finished: true,
            })
        }
        async fn stat_fs(&self, _req: StatFsReq) -> flamefs_types::Result<StatFsRsp> {
            Ok(StatFsRsp::default())
        }
        async fn set_layout(&self, _req: SetLayoutReq) -> flamefs_types::Result<SetLayoutRsp> {
            Ok(SetLayoutRsp {
                inode: Self::dummy_inode(),
            })
        }
        async fn get_real_path(
            &self,
            _req: GetRealPathReq,
        ) -> flamefs_types::Result<GetRealPathRsp> {
            Ok(GetRealPathRsp { path: "/".into() })
        }
        async fn extend_session(
            &self,
            _req: ExtendSessionReq,
        ) -> flamefs_types::Result<ExtendSessionRsp> {
            Ok(ExtendSessionRsp {})
        }
        async fn prune_session(
            &self,
            _req: PruneSessionReq,
        ) -> flamefs_types::Result<PruneSessionRsp> {
            Ok(PruneSessionRsp { pruned: 0 })
        }
    }

    fn client(service: Arc<Flaky>) -> MetaClient {
        MetaClient::new(
            service,
            MetaClientConfig {
                retry_init_wait: std::time::Duration::from_millis(1),
                retry_max_wait: std::time::Duration::from_millis(5),
                retry_total: std::time::Duration::from_secs(5),
            },
            UserInfo::root(),
        )
    }

    #[tokio::test]
    async fn test_retries_until_success_with_same_uuid() {
        let flaky = Arc::new(Flaky::new(2));
        let meta = client(Arc::clone(&flaky));

        let rsp = meta
            .create(
                PathAt::root("f"),
                0o644,
                OpenFlags(OpenFlags::O_CREAT),
                None,
            )
            .await
            .unwrap();
        assert_eq!(rsp.inode.id, InodeId(1));

        // Three calls total, all carrying the same request uuid.
        assert_eq!(flaky.inner.calls.load(Ordering::SeqCst), 3);
        let uuids = flaky.inner.seen_uuids.lock();
        assert!(uuids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let flaky = Arc::new(Flaky::new(0));
        let meta = client(Arc::clone(&flaky));
        let err = meta.remove(PathAt::root("x"), false).await.unwrap_err();
        assert_eq!(err.status_code(), Some(MetaCode::NO_PERMISSION));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausts() {
        let flaky = Arc::new(Flaky::new(u32::MAX));
        let meta = MetaClient::new(
            Arc::clone(&flaky) as Arc<dyn MetaService>,
            MetaClientConfig {
                retry_init_wait: std::time::Duration::from_millis(1),
                retry_max_wait: std::time::Duration::from_millis(2),
                retry_total: std::time::Duration::from_millis(30),
            },
            UserInfo::root(),
        );
        let err = meta.stat(PathAt::root("f"), true).await.unwrap_err();
        assert!(matches!(err, ClientError::RetryExhausted { .. }));
    }
}
