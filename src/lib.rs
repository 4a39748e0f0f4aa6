//! Keep an application-server cluster and its reverse-proxy load balancer
//! in agreement with a declared topology.
//!
//! The topology file says how many nodes each stage should run and the
//! compose runtime says how many actually do; the reconciliation engine
//! closes the gap and rewrites the proxy's upstream blocks to match. The
//! deployment workflow layers single-node operations on top: take a node
//! out of traffic, switch a version through its deployer, put it back.

pub mod bridge;
pub mod cli;
pub mod deployer;
pub mod proxy;
pub mod reconcile;
pub mod runtime;
pub mod topology;
pub mod workflow;
