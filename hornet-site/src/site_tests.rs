//! End-to-end scenarios driven through the public `Site` composition root.

mod fastpath;
mod init_abort;
mod markov;
mod ordering;
mod prefetch;
mod speculative;
mod testkit;
