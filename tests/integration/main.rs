//! Integration suite: full sessions against deterministic mock chains.

mod mock_chain;
mod scenarios;
