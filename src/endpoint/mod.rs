//! Endpoints of the system under test: replica connections and the
//! coordination service.

mod master;
mod pool;
mod replica;

pub use master::{
    EmptyArgs, LeaderReply, MasterApi, MasterStub, ReplicaListReply,
    RpcRequest, RpcResponse,
};
pub use pool::ConnPool;
pub use replica::{
    connect_replica, ReplicaIdx, ReplicaRecvStub, ReplicaSendStub, Reply,
    Request, RequestSink, PROPOSE, REPLY_LEN, REQUEST_BODY_LEN,
};

#[cfg(test)]
pub(crate) use master::tests::spawn_json_master;
