//! Chain validation
//!
//! Operators are wired by reference, so the only structural rule that can
//! be broken is acyclicity. It is checked on every rewiring, before any
//! subscription changes.

use std::collections::HashSet;

use crate::artifact::Payload;
use crate::error::{EngineError, Result};
use crate::operator::Operator;

/// True if wiring `candidate` as an input of `target` would close a cycle
pub fn would_create_cycle<T: Payload>(target: &Operator<T>, candidate: &Operator<T>) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![candidate.clone()];

    while let Some(operator) = stack.pop() {
        if operator.ptr_eq(target) {
            return true;
        }
        if !visited.insert(operator.id().serial()) {
            continue;
        }
        stack.extend(operator.upstream());
    }
    false
}

/// Fail with [`EngineError::CycleDetected`] if any candidate closes a cycle
pub fn ensure_acyclic<T: Payload>(target: &Operator<T>, candidates: &[Operator<T>]) -> Result<()> {
    if candidates.iter().any(|c| would_create_cycle(target, c)) {
        return Err(EngineError::CycleDetected {
            operator: target.id().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::operator::DeriveContext;

    fn pass_through(label: &str, input: &Operator<u32>) -> Operator<u32> {
        let op = Operator::new(label, |ctx: &DeriveContext<'_, u32>| {
            Ok(ctx.input(0).map(|a| Artifact::new(*a.payload())))
        });
        op.set_input(input).unwrap();
        op
    }

    #[test]
    fn test_cycle_is_rejected() {
        let source = Operator::constant("source", Artifact::new(1u32));
        let a = pass_through("a", &source);
        let b = pass_through("b", &a);

        let err = a.set_input(&b).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));
        // wiring unchanged
        assert!(a.upstream()[0].ptr_eq(&source));

        assert!(a.set_input(&a).is_err());
    }

    #[test]
    fn test_shared_ancestor_is_not_a_cycle() {
        let source = Operator::constant("source", Artifact::new(2u32));
        let left = pass_through("left", &source);
        let right = pass_through("right", &source);
        let merge = Operator::new("merge", |ctx: &DeriveContext<'_, u32>| {
            let sum = ctx.inputs().iter().map(|a| *a.payload()).sum();
            Ok(Some(Artifact::new(sum)))
        });

        assert!(!would_create_cycle(&merge, &left));
        merge.set_upstream(vec![left, right.clone()]).unwrap();
        assert!(would_create_cycle(&source, &merge));
        assert!(ensure_acyclic(&right, &[merge.clone()]).is_err());
        assert_eq!(*merge.get_artifact().unwrap().payload(), 4);
    }
}
