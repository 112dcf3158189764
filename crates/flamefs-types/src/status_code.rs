/// Numeric status code carried by every [`crate::Status`](crate::Status).
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const DATA_CORRUPTION: status_code_t = 2;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const AUTHENTICATION_FAIL: status_code_t = 25;
    pub const INTERRUPTED: status_code_t = 27;
    pub const INVALID_FORMAT: status_code_t = 33;
    pub const READ_ONLY_MODE: status_code_t = 34;
    pub const TOKEN_MISMATCH: status_code_t = 64;
    pub const IO_ERROR: status_code_t = 69;
    pub const OS_ERROR: status_code_t = 72;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Transaction status codes (1xxx).
pub mod TransactionCode {
    use super::status_code_t;

    pub const FAILED: status_code_t = 1000;
    pub const CONFLICT: status_code_t = 1001;
    pub const THROTTLED: status_code_t = 1002;
    pub const TOO_OLD: status_code_t = 1003;
    pub const NETWORK_ERROR: status_code_t = 1004;
    pub const CANCELED: status_code_t = 1005;
    pub const MAYBE_COMMITTED: status_code_t = 1006;
    pub const RETRYABLE: status_code_t = 1007;
    pub const RESOURCE_CONSTRAINED: status_code_t = 1008;
}

/// RPC status codes (2xxx).
pub mod RPCCode {
    use super::status_code_t;

    pub const INVALID_MESSAGE_TYPE: status_code_t = 2000;
    pub const VERIFY_REQUEST_FAILED: status_code_t = 2002;
    pub const TIMEOUT: status_code_t = 2005;
    pub const INVALID_ADDR: status_code_t = 2006;
    pub const SEND_FAILED: status_code_t = 2007;
    pub const SOCKET_ERROR: status_code_t = 2010;
    pub const REQUEST_REFUSED: status_code_t = 2012;
    pub const CONNECT_FAILED: status_code_t = 2014;
}

/// Metadata service status codes (3xxx).
pub mod MetaCode {
    use super::status_code_t;

    pub const NOT_FOUND: status_code_t = 3000;
    pub const NOT_EMPTY: status_code_t = 3001;
    pub const NOT_DIRECTORY: status_code_t = 3003;
    pub const TOO_MANY_SYMLINKS: status_code_t = 3005;
    pub const IS_DIRECTORY: status_code_t = 3006;
    pub const EXISTS: status_code_t = 3007;
    pub const NO_PERMISSION: status_code_t = 3008;
    pub const INCONSISTENT: status_code_t = 3009;
    pub const NOT_FILE: status_code_t = 3010;
    pub const INODE_ID_ALLOC_FAILED: status_code_t = 3012;
    pub const INVALID_FILE_LAYOUT: status_code_t = 3013;
    pub const MORE_CHUNKS_TO_REMOVE: status_code_t = 3016;
    pub const NAME_TOO_LONG: status_code_t = 3017;
    pub const REQUEST_CANCELED: status_code_t = 3018;
    pub const BUSY: status_code_t = 3019;
    pub const NOT_LOCAL: status_code_t = 3020;
    pub const NO_SESSION: status_code_t = 3021;
    pub const RETRYABLE: status_code_t = 3200;
    pub const FORWARD_FAILED: status_code_t = 3201;
    pub const OPERATION_TIMEOUT: status_code_t = 3203;
    pub const FOUND_BUG: status_code_t = 3999;
}

/// Storage service status codes (4xxx).
pub mod StorageCode {
    use super::status_code_t;

    pub const CHUNK_NOT_FOUND: status_code_t = 4001;
    pub const CHUNK_NOT_COMMIT: status_code_t = 4004;
    pub const CHUNK_STALE_UPDATE: status_code_t = 4006;
    pub const CHUNK_MISSING_UPDATE: status_code_t = 4007;
    pub const CHUNK_COMMITTED_UPDATE: status_code_t = 4008;
    pub const CHUNK_SIZE_MISMATCH: status_code_t = 4015;
    pub const TARGET_OFFLINE: status_code_t = 4030;
    pub const TARGET_NOT_FOUND: status_code_t = 4031;
    pub const TARGET_STATE_INVALID: status_code_t = 4032;
    pub const NO_SUCCESSOR_TARGET: status_code_t = 4033;
    pub const SYNC_START_FAILED: status_code_t = 4070;
    pub const CHECKSUM_MISMATCH: status_code_t = 4080;
    pub const CHAIN_VERSION_MISMATCH: status_code_t = 4081;
    pub const CHUNK_VERSION_MISMATCH: status_code_t = 4082;
}

/// Management service status codes (5xxx).
pub mod MgmtdCode {
    use super::status_code_t;

    pub const NOT_PRIMARY: status_code_t = 5000;
    pub const NODE_NOT_FOUND: status_code_t = 5001;
    pub const HEARTBEAT_FAIL: status_code_t = 5002;
    pub const CLUSTER_ID_MISMATCH: status_code_t = 5003;
    pub const CHAIN_NOT_FOUND: status_code_t = 5004;
    pub const CHAIN_TABLE_NOT_FOUND: status_code_t = 5005;
    pub const STALE_ROUTING: status_code_t = 5006;
    pub const LEASE_EXPIRED: status_code_t = 5007;
    pub const INVALID_CHAIN: status_code_t = 5008;
    pub const CLIENT_SESSION_NOT_FOUND: status_code_t = 5009;
}

/// Map a status code to its symbolic name, e.g. `3000` -> `"Meta::NotFound"`.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::DATA_CORRUPTION => "DataCorruption",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::AUTHENTICATION_FAIL => "AuthenticationFail",
        StatusCode::INTERRUPTED => "Interrupted",
        StatusCode::INVALID_FORMAT => "InvalidFormat",
        StatusCode::READ_ONLY_MODE => "ReadOnlyMode",
        StatusCode::TOKEN_MISMATCH => "TokenMismatch",
        StatusCode::IO_ERROR => "IoError",
        StatusCode::OS_ERROR => "OsError",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        TransactionCode::FAILED => "Txn::Failed",
        TransactionCode::CONFLICT => "Txn::Conflict",
        TransactionCode::THROTTLED => "Txn::Throttled",
        TransactionCode::TOO_OLD => "Txn::TooOld",
        TransactionCode::NETWORK_ERROR => "Txn::NetworkError",
        TransactionCode::CANCELED => "Txn::Canceled",
        TransactionCode::MAYBE_COMMITTED => "Txn::MaybeCommitted",
        TransactionCode::RETRYABLE => "Txn::Retryable",
        TransactionCode::RESOURCE_CONSTRAINED => "Txn::ResourceConstrained",

        RPCCode::INVALID_MESSAGE_TYPE => "RPC::InvalidMessageType",
        RPCCode::VERIFY_REQUEST_FAILED => "RPC::VerifyRequestFailed",
        RPCCode::TIMEOUT => "RPC::Timeout",
        RPCCode::INVALID_ADDR => "RPC::InvalidAddr",
        RPCCode::SEND_FAILED => "RPC::SendFailed",
        RPCCode::SOCKET_ERROR => "RPC::SocketError",
        RPCCode::REQUEST_REFUSED => "RPC::RequestRefused",
        RPCCode::CONNECT_FAILED => "RPC::ConnectFailed",

        MetaCode::NOT_FOUND => "Meta::NotFound",
        MetaCode::NOT_EMPTY => "Meta::NotEmpty",
        MetaCode::NOT_DIRECTORY => "Meta::NotDirectory",
        MetaCode::TOO_MANY_SYMLINKS => "Meta::TooManySymlinks",
        MetaCode::IS_DIRECTORY => "Meta::IsDirectory",
        MetaCode::EXISTS => "Meta::Exists",
        MetaCode::NO_PERMISSION => "Meta::NoPermission",
        MetaCode::INCONSISTENT => "Meta::Inconsistent",
        MetaCode::NOT_FILE => "Meta::NotFile",
        MetaCode::INODE_ID_ALLOC_FAILED => "Meta::InodeIdAllocFailed",
        MetaCode::INVALID_FILE_LAYOUT => "Meta::InvalidFileLayout",
        MetaCode::MORE_CHUNKS_TO_REMOVE => "Meta::MoreChunksToRemove",
        MetaCode::NAME_TOO_LONG => "Meta::NameTooLong",
        MetaCode::REQUEST_CANCELED => "Meta::RequestCanceled",
        MetaCode::BUSY => "Meta::Busy",
        MetaCode::NOT_LOCAL => "Meta::NotLocal",
        MetaCode::NO_SESSION => "Meta::NoSession",
        MetaCode::RETRYABLE => "Meta::Retryable",
        MetaCode::FORWARD_FAILED => "Meta::ForwardFailed",
        MetaCode::OPERATION_TIMEOUT => "Meta::OperationTimeout",
        MetaCode::FOUND_BUG => "Meta::FoundBug",

        StorageCode::CHUNK_NOT_FOUND => "Storage::ChunkNotFound",
        StorageCode::CHUNK_NOT_COMMIT => "Storage::ChunkNotCommit",
        StorageCode::CHUNK_STALE_UPDATE => "Storage::ChunkStaleUpdate",
        StorageCode::CHUNK_MISSING_UPDATE => "Storage::ChunkMissingUpdate",
        StorageCode::CHUNK_COMMITTED_UPDATE => "Storage::ChunkCommittedUpdate",
        StorageCode::CHUNK_SIZE_MISMATCH => "Storage::ChunkSizeMismatch",
        StorageCode::TARGET_OFFLINE => "Storage::TargetOffline",
        StorageCode::TARGET_NOT_FOUND => "Storage::TargetNotFound",
        StorageCode::TARGET_STATE_INVALID => "Storage::TargetStateInvalid",
        StorageCode::NO_SUCCESSOR_TARGET => "Storage::NoSuccessorTarget",
        StorageCode::SYNC_START_FAILED => "Storage::SyncStartFailed",
        StorageCode::CHECKSUM_MISMATCH => "Storage::ChecksumMismatch",
        StorageCode::CHAIN_VERSION_MISMATCH => "Storage::ChainVersionMismatch",
        StorageCode::CHUNK_VERSION_MISMATCH => "Storage::ChunkVersionMismatch",

        MgmtdCode::NOT_PRIMARY => "Mgmtd::NotPrimary",
        MgmtdCode::NODE_NOT_FOUND => "Mgmtd::NodeNotFound",
        MgmtdCode::HEARTBEAT_FAIL => "Mgmtd::HeartbeatFail",
        MgmtdCode::CLUSTER_ID_MISMATCH => "Mgmtd::ClusterIdMismatch",
        MgmtdCode::CHAIN_NOT_FOUND => "Mgmtd::ChainNotFound",
        MgmtdCode::CHAIN_TABLE_NOT_FOUND => "Mgmtd::ChainTableNotFound",
        MgmtdCode::STALE_ROUTING => "Mgmtd::StaleRouting",
        MgmtdCode::LEASE_EXPIRED => "Mgmtd::LeaseExpired",
        MgmtdCode::INVALID_CHAIN => "Mgmtd::InvalidChain",
        MgmtdCode::CLIENT_SESSION_NOT_FOUND => "Mgmtd::ClientSessionNotFound",

        _ => "Unrecognized",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_known() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(TransactionCode::CONFLICT), "Txn::Conflict");
        assert_eq!(to_string(MetaCode::NOT_FOUND), "Meta::NotFound");
        assert_eq!(
            to_string(StorageCode::CHAIN_VERSION_MISMATCH),
            "Storage::ChainVersionMismatch"
        );
        assert_eq!(to_string(MgmtdCode::NOT_PRIMARY), "Mgmtd::NotPrimary");
    }

    #[test]
    fn test_to_string_unknown() {
        assert_eq!(to_string(9999), "Unrecognized");
    }
}
