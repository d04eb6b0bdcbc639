//! In-process cluster tests.
//!
//! `NodeContext` keeps all node state explicit, so these tests boot whole
//! clusters inside one process: real sockets, real sled stores in temp
//! directories, and a static discovery set standing in for the port scan.

mod integration_test;
