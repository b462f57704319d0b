use std::rc::Rc;
use std::thread::ThreadId;

use crate::bridge::ServiceLauncher;
use crate::config::Params;
use crate::netconf::NetConf;
use crate::prefix::PrefixPool;

/// The one thread all topology and host state is mutated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopThread(ThreadId);

impl LoopThread {
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }

    pub fn check(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.0,
            "called from outside the event loop thread"
        );
    }
}

/// Process-wide state, owned by the daemon and lent to each component.
pub struct Context {
    pub params: Params,
    pub pool: PrefixPool,
    pub net: Rc<dyn NetConf>,
    pub launcher: Rc<dyn ServiceLauncher>,
    pub thread: LoopThread,
}

impl Context {
    pub fn new(
        params: Params,
        pool: PrefixPool,
        net: Rc<dyn NetConf>,
        launcher: Rc<dyn ServiceLauncher>,
    ) -> Self {
        Self {
            params,
            pool,
            net,
            launcher,
            thread: LoopThread::current(),
        }
    }
}
