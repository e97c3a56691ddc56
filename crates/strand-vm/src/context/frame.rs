//! Activation frames.
//!
//! The frame stack is a singly linked list owned from the top: every frame
//! owns the frame it was called from. Only the owning thread pushes and pops;
//! a collector reads the chain only while that thread is parked.

use crate::value::{ObjectRef, Value};

/// One activation record.
#[derive(Debug)]
pub struct CallFrame {
    previous: Option<Box<CallFrame>>,
    /// The code object being executed.
    pub method: Value,
    /// `self` for this activation.
    pub receiver: Value,
    /// Argument and local variable slots.
    pub locals: Vec<Value>,
    /// Bytecode offset of the next instruction.
    pub ip: usize,
}

impl CallFrame {
    /// A fresh frame with `locals` slots initialized to `false`.
    #[must_use]
    pub fn new(method: Value, receiver: Value, locals: usize) -> Box<Self> {
        Box::new(Self {
            previous: None,
            method,
            receiver,
            locals: vec![Value::FALSE; locals],
            ip: 0,
        })
    }

    /// The caller's frame.
    #[must_use]
    pub fn previous(&self) -> Option<&Self> {
        self.previous.as_deref()
    }

    /// Apply `f` to every heap reference held by this frame, storing back the
    /// result.
    pub fn visit_roots(&mut self, f: &mut dyn FnMut(ObjectRef) -> ObjectRef) {
        self.method = self.method.map_object(&mut *f);
        self.receiver = self.receiver.map_object(&mut *f);
        for slot in &mut self.locals {
            *slot = slot.map_object(&mut *f);
        }
    }
}

/// Owning head of the frame chain plus its depth.
#[derive(Debug, Default)]
pub struct FrameStack {
    top: Option<Box<CallFrame>>,
    depth: usize,
}

impl FrameStack {
    /// An empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            top: None,
            depth: 0,
        }
    }

    /// Install `frame` as the new top, linking the previous top beneath it.
    pub fn push(&mut self, mut frame: Box<CallFrame>) {
        debug_assert!(frame.previous.is_none(), "frame is already linked");
        frame.previous = self.top.take();
        self.top = Some(frame);
        self.depth += 1;
    }

    /// Unlink the top frame and restore its caller as current.
    pub fn pop(&mut self) -> Option<Box<CallFrame>> {
        let mut frame = self.top.take()?;
        self.top = frame.previous.take();
        self.depth -= 1;
        Some(frame)
    }

    /// The current frame.
    #[must_use]
    pub fn top(&self) -> Option<&CallFrame> {
        self.top.as_deref()
    }

    /// The current frame, mutably.
    pub fn top_mut(&mut self) -> Option<&mut CallFrame> {
        self.top.as_deref_mut()
    }

    /// The frame `up` levels below the top.
    #[must_use]
    pub fn get(&self, up: usize) -> Option<&CallFrame> {
        self.iter().nth(up)
    }

    /// Number of frames.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Whether there are no frames.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.depth == 0
    }

    /// Walk from the top frame down to the outermost one.
    pub fn iter(&self) -> impl Iterator<Item = &CallFrame> {
        std::iter::successors(self.top(), |frame| frame.previous())
    }

    /// Visit every root in every frame.
    pub fn visit_roots(&mut self, f: &mut dyn FnMut(ObjectRef) -> ObjectRef) {
        let mut cursor = self.top.as_deref_mut();
        while let Some(frame) = cursor {
            frame.visit_roots(f);
            cursor = frame.previous.as_deref_mut();
        }
    }
}

impl Drop for FrameStack {
    fn drop(&mut self) {
        // Unlink iteratively; the default recursive drop can overflow on deep chains.
        let mut next = self.top.take();
        while let Some(mut frame) = next {
            next = frame.previous.take();
        }
    }
}
