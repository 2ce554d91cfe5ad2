mod helpers;
mod rpc;
