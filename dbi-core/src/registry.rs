//! Handler registry
//!
//! Maps an annotation call-site address (or, for the Valgrind client-request pattern, a request
//! ID) to the handler that should run when the matcher recognizes it. A single reader/writer lock
//! guards both the call-site map and the Valgrind array: lookups during code generation take a
//! read lock, registrations and module-unload sweeps take a write lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

/// A single operand the client registered to be passed to a [`AnnotationHandler::Call`] callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandDescriptor {
    /// The operand lives in a general-purpose register, numbered per the host runtime's
    /// convention
    Register(u8),
    /// The operand is a literal value
    Immediate(i64),
}

/// A callback registered against a direct-call annotation or a Valgrind client request
///
/// Boxed as `Arc<dyn Fn>` because the registering extension and the dispatching matcher live in
/// different compilation units in the host runtime's real deployment; a function pointer would
/// not survive that boundary the way a trait object does.
pub type Callback = Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>;

/// One registered annotation handler
#[derive(Clone)]
pub enum AnnotationHandler {
    /// Dispatch to `callback` whenever a direct call to `target_pc` is seen
    Call {
        /// The call-site target address this handler answers for
        target_pc: u64,
        /// The function to invoke; receives the marshaled argument bytes
        callback: Callback,
        /// Whether the clean call emitted for this handler must save/restore floating-point
        /// state
        save_fpstate: bool,
        /// Descriptors for the arguments that must be marshaled before the callback runs
        args: Vec<OperandDescriptor>,
    },
    /// Splice in a fixed return value whenever a direct call to `target_pc` is seen
    ReturnValue {
        /// The call-site target address this handler answers for
        target_pc: u64,
        /// The value to return
        value: u64,
    },
}

impl AnnotationHandler {
    /// The call-site address this handler answers for
    #[must_use]
    pub fn target_pc(&self) -> u64 {
        match self {
            Self::Call { target_pc, .. } | Self::ReturnValue { target_pc, .. } => *target_pc,
        }
    }
}

impl std::fmt::Debug for AnnotationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call {
                target_pc,
                save_fpstate,
                args,
                ..
            } => f
                .debug_struct("Call")
                .field("target_pc", &format_args!("{target_pc:#x}"))
                .field("save_fpstate", save_fpstate)
                .field("args", args)
                .finish_non_exhaustive(),
            Self::ReturnValue { target_pc, value } => f
                .debug_struct("ReturnValue")
                .field("target_pc", &format_args!("{target_pc:#x}"))
                .field("value", value)
                .finish(),
        }
    }
}

/// A node in the singly linked chain of handlers registered at one call-site address
///
/// Registration currently returns early on a duplicate key (see [`HandlerRegistry::register_call`]),
/// so in practice `next` is always `None`; the field is kept because the matcher is specified to
/// traverse a chain, and future registration policy changes (append instead of ignore) should not
/// require reshaping this type. See the design notes for the open question this resolves.
#[derive(Debug, Clone)]
struct HandlerNode {
    handler: AnnotationHandler,
    next: Option<Box<HandlerNode>>,
}

/// The highest Valgrind request ID this registry's direct-indexed array accepts
pub const VG_LAST: usize = 4096;

struct Inner {
    calls: HashMap<u64, HandlerNode>,
    valgrind: Vec<Option<Callback>>,
}

/// Keyed store of registered annotation handlers
///
/// Readers (basic-block instrumentation) and writers (client registration, module unload) share
/// this registry through a single [`RwLock`]; see the concurrency model for why the lock is kept
/// innermost.
pub struct HandlerRegistry {
    inner: RwLock<Inner>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Build an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                calls: HashMap::new(),
                valgrind: vec![None; VG_LAST],
            }),
        }
    }

    /// Register a `Call` handler for `func_pc`
    ///
    /// If a handler is already registered at `func_pc`, the registration is ignored and the
    /// existing handler is kept.
    pub fn register_call(
        &self,
        func_pc: u64,
        callback: Callback,
        save_fpstate: bool,
        args: Vec<OperandDescriptor>,
    ) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.calls.contains_key(&func_pc) {
            debug!("ignoring duplicate Call registration at {func_pc:#x}");
            return;
        }
        debug!("registering Call handler at {func_pc:#x}");
        inner.calls.insert(
            func_pc,
            HandlerNode {
                handler: AnnotationHandler::Call {
                    target_pc: func_pc,
                    callback,
                    save_fpstate,
                    args,
                },
                next: None,
            },
        );
    }

    /// Register a `ReturnValue` handler for `func_pc`
    ///
    /// If a handler is already registered at `func_pc`, the registration is ignored and the
    /// existing handler is kept.
    pub fn register_return(&self, func_pc: u64, value: u64) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.calls.contains_key(&func_pc) {
            debug!("ignoring duplicate ReturnValue registration at {func_pc:#x}");
            return;
        }
        debug!("registering ReturnValue handler at {func_pc:#x} -> {value}");
        inner.calls.insert(
            func_pc,
            HandlerNode {
                handler: AnnotationHandler::ReturnValue {
                    target_pc: func_pc,
                    value,
                },
                next: None,
            },
        );
    }

    /// Register a Valgrind request handler
    ///
    /// Out-of-range `request_id`s are silently dropped; an existing handler at `request_id` is
    /// kept on a duplicate registration.
    pub fn register_valgrind(&self, request_id: usize, callback: Callback) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(slot) = inner.valgrind.get_mut(request_id) else {
            debug!("dropping out-of-range valgrind request id {request_id}");
            return;
        };
        if slot.is_some() {
            debug!("ignoring duplicate valgrind registration for request id {request_id}");
            return;
        }
        debug!("registering valgrind handler for request id {request_id}");
        *slot = Some(callback);
    }

    /// Remove every call-site key strictly between `low` and `high`
    ///
    /// Called on module unload; safe to call even if no key in the range is registered.
    pub fn sweep_range(&self, low: u64, high: u64) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let before = inner.calls.len();
        inner.calls.retain(|&pc, _| !(low < pc && pc < high));
        let removed = before - inner.calls.len();
        if removed > 0 {
            debug!("module unload swept {removed} handler(s) in ({low:#x}, {high:#x})");
        }
    }

    /// Return the chain of handlers registered at `pc`, head first
    ///
    /// Empty if nothing is registered at `pc`.
    #[must_use]
    pub fn lookup(&self, pc: u64) -> Vec<AnnotationHandler> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(mut node) = inner.calls.get(&pc) else {
            return Vec::new();
        };
        let mut chain = vec![node.handler.clone()];
        while let Some(next) = &node.next {
            chain.push(next.handler.clone());
            node = next;
        }
        chain
    }

    /// Look up the callback registered for a Valgrind request ID, if any
    #[must_use]
    pub fn lookup_valgrind(&self, request_id: usize) -> Option<Callback> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.valgrind.get(request_id).cloned().flatten()
    }
}
