use std::fmt;
use std::ops::Range;

use cranelift_module::ModuleError;
use thiserror::Error;

use crate::codegen::ir::{Base, ClassId};
use crate::codegen::value::ValueKind;
use crate::runtime::types::{NodeKey, SurfaceKey};

/// Where a codegen error originated. `span` is a byte range inside custom
/// node source code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePos {
    pub surface: Option<SurfaceKey>,
    pub node: Option<NodeKey>,
    pub span: Option<Range<usize>>,
}

impl SourcePos {
    pub fn span(span: Range<usize>) -> Self {
        Self {
            span: Some(span),
            ..Self::default()
        }
    }

    pub fn node(node: NodeKey) -> Self {
        Self {
            node: Some(node),
            ..Self::default()
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(surface) = self.surface {
            write!(f, "surface {:?}", surface)?;
            wrote = true;
        }
        if let Some(node) = self.node {
            if wrote {
                f.write_str(", ")?;
            }
            write!(f, "node {:?}", node)?;
            wrote = true;
        }
        if let Some(span) = &self.span {
            if wrote {
                f.write_str(", ")?;
            }
            write!(f, "bytes {}..{}", span.start, span.end)?;
            wrote = true;
        }
        if !wrote {
            f.write_str("<unknown>")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("{pos}: `{function}` expects {expected} argument(s), found {found}")]
    Arity {
        function: &'static str,
        expected: usize,
        found: usize,
        pos: SourcePos,
    },
    #[error("{pos}: expected a {expected} value, found {found}")]
    KindMismatch {
        expected: ValueKind,
        found: ValueKind,
        pos: SourcePos,
    },
    #[error("{pos}: unknown function `{name}`")]
    UnknownFunction { name: String, pos: SourcePos },
    #[error("{pos}: unknown name `{name}`")]
    UnknownName { name: String, pos: SourcePos },
    #[error("{pos}: invalid operator `{op}`")]
    InvalidOperator { op: String, pos: SourcePos },
    #[error("{pos}: {message}")]
    Parse { message: String, pos: SourcePos },
    #[error("{pos}: connection to unknown port `{port}`")]
    UnresolvedConnection { port: String, pos: SourcePos },
    #[error("{pos}: port `{port}` is driven from outside and by a node output")]
    ConflictingDrivers { port: String, pos: SourcePos },
    #[error("{pos}: cycle through {} node(s) without a History node", path.len())]
    Cycle { path: Vec<NodeKey>, pos: SourcePos },
    #[error("{pos}: output `{name}` read before it was assigned")]
    OutputReadBeforeWrite { name: String, pos: SourcePos },
    #[error("{pos}: node has more than {limit} ports")]
    TooManyPorts { limit: usize, pos: SourcePos },
}

impl CodegenError {
    pub fn pos(&self) -> &SourcePos {
        match self {
            CodegenError::Arity { pos, .. }
            | CodegenError::KindMismatch { pos, .. }
            | CodegenError::UnknownFunction { pos, .. }
            | CodegenError::UnknownName { pos, .. }
            | CodegenError::InvalidOperator { pos, .. }
            | CodegenError::Parse { pos, .. }
            | CodegenError::UnresolvedConnection { pos, .. }
            | CodegenError::ConflictingDrivers { pos, .. }
            | CodegenError::Cycle { pos, .. }
            | CodegenError::OutputReadBeforeWrite { pos, .. }
            | CodegenError::TooManyPorts { pos, .. } => pos,
        }
    }

    fn pos_mut(&mut self) -> &mut SourcePos {
        match self {
            CodegenError::Arity { pos, .. }
            | CodegenError::KindMismatch { pos, .. }
            | CodegenError::UnknownFunction { pos, .. }
            | CodegenError::UnknownName { pos, .. }
            | CodegenError::InvalidOperator { pos, .. }
            | CodegenError::Parse { pos, .. }
            | CodegenError::UnresolvedConnection { pos, .. }
            | CodegenError::ConflictingDrivers { pos, .. }
            | CodegenError::Cycle { pos, .. }
            | CodegenError::OutputReadBeforeWrite { pos, .. }
            | CodegenError::TooManyPorts { pos, .. } => pos,
        }
    }

    /// Fills in the span unless a more precise one is already recorded.
    pub fn with_span(mut self, span: Range<usize>) -> Self {
        let pos = self.pos_mut();
        if pos.span.is_none() {
            pos.span = Some(span);
        }
        self
    }

    pub fn with_node(mut self, node: NodeKey) -> Self {
        let pos = self.pos_mut();
        if pos.node.is_none() {
            pos.node = Some(node);
        }
        self
    }

    pub fn with_surface(mut self, surface: SurfaceKey) -> Self {
        let pos = self.pos_mut();
        if pos.surface.is_none() {
            pos.surface = Some(surface);
        }
        self
    }
}

/// Every codegen error of one compile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub errors: Vec<CodegenError>,
}

impl CompileReport {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Errors attributed to one node.
    pub fn for_node(&self, node: NodeKey) -> impl Iterator<Item = &CodegenError> {
        self.errors
            .iter()
            .filter(move |error| error.pos().node == Some(node))
    }
}

impl fmt::Display for CompileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileReport {}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no native code generator for this host: {0}")]
    NoNativeTarget(&'static str),
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
    #[error("invalid code generator setting: {0}")]
    Settings(String),
    #[error("instruction selection failed: {0}")]
    Isa(#[from] cranelift_codegen::CodegenError),
    #[error("module error: {0}")]
    Module(#[from] ModuleError),
    #[error("address based on {0:?} was not bound before lowering")]
    Unbound(Base),
    #[error("register r{0} used before definition")]
    UndefinedRegister(u32),
    #[error("class {0:?} was not declared in this module")]
    UnknownClass(ClassId),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compile failed:\n{0}")]
    Codegen(CompileReport),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CompileError {
    pub fn report(&self) -> Option<&CompileReport> {
        match self {
            CompileError::Codegen(report) => Some(report),
            CompileError::Backend(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("no such surface {0:?}")]
    NoSuchSurface(SurfaceKey),
    #[error("no such node {0:?}")]
    NoSuchNode(NodeKey),
    #[error("node {0:?} was removed")]
    NodeRemoved(NodeKey),
    #[error("node {0:?} is not a group")]
    NotAGroup(NodeKey),
    #[error("node {0:?} is a main input or output of its surface")]
    ProtectedNode(NodeKey),
    #[error("group nodes are created with `add_group`")]
    GroupKind,
    #[error("nodes {from:?} and {to:?} belong to different surfaces")]
    CrossSurface { from: NodeKey, to: NodeKey },
    #[error("expected a {expected} slot, found {found}")]
    WrongKind { expected: ValueKind, found: ValueKind },
    #[error("port is not part of the compiled surface")]
    UnknownGroup,
    #[error("nothing has been compiled yet")]
    NotCompiled,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("export `{export}`: `{port}` has no storage slot")]
    UnresolvedGroup { export: String, port: String },
    #[error("an export named `{0}` already exists")]
    DuplicateName(String),
    #[error("symbol `{0}` must have local linkage")]
    LinkageViolation(String),
    #[error("object emission failed: {0}")]
    Emit(String),
}

impl From<ModuleError> for ExportError {
    fn from(error: ModuleError) -> Self {
        ExportError::Backend(BackendError::Module(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_span_keeps_inner_span() {
        let error = CodegenError::UnknownName {
            name: "foo".into(),
            pos: SourcePos::span(4..7),
        };
        let error = error.with_span(0..12);
        assert_eq!(error.pos().span, Some(4..7));
    }

    #[test]
    fn report_display_lists_each_error() {
        let report = CompileReport {
            errors: vec![
                CodegenError::UnknownFunction {
                    name: "foo".into(),
                    pos: SourcePos::span(0..3),
                },
                CodegenError::UnknownName {
                    name: "bar".into(),
                    pos: SourcePos::default(),
                },
            ],
        };
        let text = report.to_string();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("unknown function `foo`"));
        assert!(text.contains("<unknown>: unknown name `bar`"));
    }
}
