//! Policy providers: where engines get their compiled policy set from.
//!
//! [`StaticProvider`] serves a fixed list compiled once. [`WatchProvider`]
//! is driven by a reconciler: each change event recompiles one policy and
//! swaps it in under a write lock, while engines read under the read lock.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use celgate_protocol::{PolicyDocument, PolicyException, PolicySpec};

use crate::compiled::NamedPolicy;
use crate::compiler::Compiler;
use crate::error::{PolicyError, Result};
use crate::selector::Selector;

/// Supplies the current set of compiled policies.
pub trait Provider<P> {
    fn fetch(&self) -> Result<Vec<Arc<P>>>;

    fn get(&self, name: &str) -> Result<Option<Arc<P>>>;
}

/// Lists the policy exceptions the cluster currently holds.
pub trait ExceptionLister {
    fn list(&self, selector: &Selector) -> Result<Vec<PolicyException>>;
}

impl ExceptionLister for Vec<PolicyException> {
    fn list(&self, selector: &Selector) -> Result<Vec<PolicyException>> {
        Ok(self
            .iter()
            .filter(|e| selector.matches(&e.metadata.labels))
            .cloned()
            .collect())
    }
}

/// The exceptions that name `policy` by name and kind.
pub fn exceptions_for<S: PolicySpec>(
    lister: &dyn ExceptionLister,
    policy: &PolicyDocument<S>,
) -> Result<Vec<PolicyException>> {
    Ok(lister
        .list(&Selector::Everything)?
        .into_iter()
        .filter(|e| e.applies_to(policy.name(), S::KIND))
        .collect())
}

/// A fixed set of compiled policies.
#[derive(Debug)]
pub struct StaticProvider<P> {
    policies: Vec<Arc<P>>,
}

impl<P> StaticProvider<P> {
    pub fn new(policies: Vec<P>) -> Self {
        Self {
            policies: policies.into_iter().map(Arc::new).collect(),
        }
    }

    /// Compile `policies`, each with the exceptions that reference it.
    ///
    /// The first policy that fails to compile fails the whole set.
    pub fn compile<C>(
        compiler: &C,
        policies: &[PolicyDocument<C::Spec>],
        exceptions: &[PolicyException],
    ) -> Result<Self>
    where
        C: Compiler<Output = P>,
    {
        let mut compiled = Vec::with_capacity(policies.len());
        for policy in policies {
            let output = compiler
                .compile(policy, exceptions)
                .map_err(|errors| PolicyError::Compile {
                    name: policy.name().to_string(),
                    errors,
                })?;
            compiled.push(output);
        }
        Ok(Self::new(compiled))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl<P: NamedPolicy> Provider<P> for StaticProvider<P> {
    fn fetch(&self) -> Result<Vec<Arc<P>>> {
        Ok(self.policies.clone())
    }

    fn get(&self, name: &str) -> Result<Option<Arc<P>>> {
        Ok(self
            .policies
            .iter()
            .find(|p| p.policy_name() == name)
            .cloned())
    }
}

struct Entry<C: Compiler> {
    source: PolicyDocument<C::Spec>,
    compiled: Arc<C::Output>,
    /// `(namespace, name)` of the exceptions compiled in.
    exceptions: Vec<(String, String)>,
}

/// A reconciler-fed cache of compiled policies keyed by name.
pub struct WatchProvider<C: Compiler> {
    compiler: C,
    exceptions: Box<dyn ExceptionLister + Send + Sync>,
    policies: RwLock<BTreeMap<String, Entry<C>>>,
}

impl<C: Compiler> WatchProvider<C> {
    pub fn new(compiler: C, exceptions: Box<dyn ExceptionLister + Send + Sync>) -> Self {
        Self {
            compiler,
            exceptions,
            policies: RwLock::new(BTreeMap::new()),
        }
    }

    /// Compile and store `policy`, replacing any previous version.
    ///
    /// A policy that no longer compiles is removed so a stale version
    /// never keeps serving.
    pub fn reconcile(&self, policy: PolicyDocument<C::Spec>) -> Result<()> {
        let name = policy.name().to_string();
        let exceptions = exceptions_for(self.exceptions.as_ref(), &policy)?;
        match self.compiler.compile(&policy, &exceptions) {
            Ok(compiled) => {
                log::debug!("compiled {} {}", C::Spec::KIND, name);
                self.write()?.insert(
                    name,
                    Entry {
                        source: policy,
                        compiled: Arc::new(compiled),
                        exceptions: exceptions.iter().map(exception_key).collect(),
                    },
                );
                Ok(())
            }
            Err(errors) => {
                log::warn!("{} {} failed to compile: {}", C::Spec::KIND, name, errors);
                self.write()?.remove(&name);
                Err(PolicyError::Compile { name, errors })
            }
        }
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.write()?.remove(name);
        Ok(())
    }

    /// Recompile every policy `exception` names now or was compiled into.
    ///
    /// The second set covers an exception retargeted away from a policy,
    /// which must drop it.
    pub fn exception_changed(&self, exception: &PolicyException) -> Result<()> {
        let key = exception_key(exception);
        let affected: Vec<PolicyDocument<C::Spec>> = self
            .read()?
            .values()
            .filter(|e| {
                exception.applies_to(e.source.name(), C::Spec::KIND) || e.exceptions.contains(&key)
            })
            .map(|e| e.source.clone())
            .collect();
        let mut first_error = None;
        for policy in affected {
            if let Err(e) = self.reconcile(policy) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Names of the policies currently served.
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry<C>>>> {
        self.policies.read().map_err(|_| PolicyError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry<C>>>> {
        self.policies.write().map_err(|_| PolicyError::Poisoned)
    }
}

fn exception_key(exception: &PolicyException) -> (String, String) {
    (
        exception.metadata.namespace.clone(),
        exception.metadata.name.clone(),
    )
}

impl<C: Compiler> Provider<C::Output> for WatchProvider<C> {
    fn fetch(&self) -> Result<Vec<Arc<C::Output>>> {
        Ok(self.read()?.values().map(|e| e.compiled.clone()).collect())
    }

    fn get(&self, name: &str) -> Result<Option<Arc<C::Output>>> {
        Ok(self.read()?.get(name).map(|e| e.compiled.clone()))
    }
}
