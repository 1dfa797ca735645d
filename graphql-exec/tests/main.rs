mod helpers;

mod batching;
mod execution;
mod incremental;
