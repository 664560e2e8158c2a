//! The authorization seam.
//!
//! Credential checks live outside the registry. The registry asks an
//! [`AccessGate`] one question per request and trusts the answer.

use std::fmt;

use crate::name::RepositoryName;

/// What a request wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read image metadata, layers or ancestry
    ReadImage,
    /// Push image metadata, layers or checksums
    WriteImage,
    /// Read repository tags or image lists
    ReadRepository,
    /// Create a repository, push tags, or finalize a push
    WriteRepository,
}

impl Action {
    /// Whether this action changes registry state.
    pub fn is_write(self) -> bool {
        matches!(self, Action::WriteImage | Action::WriteRepository)
    }
}

/// The entity a request acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource<'a> {
    /// An image, by id
    Image(&'a str),
    /// A repository
    Repository(&'a RepositoryName),
}

impl fmt::Display for Resource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Image(id) => write!(f, "image {id}"),
            Resource::Repository(name) => write!(f, "repository {name}"),
        }
    }
}

/// The identity a request is made under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor(String);

impl Actor {
    /// The name used for requests without credentials.
    pub const ANONYMOUS: &'static str = "anonymous";

    /// An actor with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The actor for requests without credentials.
    pub fn anonymous() -> Self {
        Self::new(Self::ANONYMOUS)
    }

    /// The actor's name.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Whether this is the anonymous actor.
    pub fn is_anonymous(&self) -> bool {
        self.0 == Self::ANONYMOUS
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether an actor may perform an action on a resource.
pub trait AccessGate: Send + Sync {
    /// Return true to let the request through.
    fn allows(&self, actor: &Actor, action: Action, resource: &Resource<'_>) -> bool;
}

impl<F> AccessGate for F
where
    F: Fn(&Actor, Action, &Resource<'_>) -> bool + Send + Sync,
{
    fn allows(&self, actor: &Actor, action: Action, resource: &Resource<'_>) -> bool {
        self(actor, action, resource)
    }
}

/// A gate which lets every request through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn allows(&self, _actor: &Actor, _action: Action, _resource: &Resource<'_>) -> bool {
        true
    }
}

/// A gate which allows reads to everyone and writes to named actors only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlyAnonymous;

impl AccessGate for ReadOnlyAnonymous {
    fn allows(&self, actor: &Actor, action: Action, _resource: &Resource<'_>) -> bool {
        !action.is_write() || !actor.is_anonymous()
    }
}
