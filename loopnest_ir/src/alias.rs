use crate::*;

/*
 * Result of an alias query between two symbol bases.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasResult {
    /// Definitely different objects.
    NoAlias,
    /// Possibly the same object (conservative).
    MayAlias,
    /// Definitely the same object.
    MustAlias,
}

impl AliasResult {
    pub fn may_alias(self) -> bool {
        matches!(self, AliasResult::MayAlias | AliasResult::MustAlias)
    }

    pub fn no_alias(self) -> bool {
        matches!(self, AliasResult::NoAlias)
    }

    /// Combine two results. NoAlias wins outright; MustAlias survives only
    /// when both sides agree.
    pub fn meet(self, other: AliasResult) -> AliasResult {
        match (self, other) {
            (AliasResult::NoAlias, _) | (_, AliasResult::NoAlias) => AliasResult::NoAlias,
            (AliasResult::MustAlias, AliasResult::MustAlias) => AliasResult::MustAlias,
            _ => AliasResult::MayAlias,
        }
    }
}

/*
 * Base-level alias oracle for the dependence engine. Named arrays are
 * distinct objects unless the function carries an explicit may-alias
 * declaration linking them; the same base always aliases itself. The engine
 * invokes this lazily, per candidate pair, never eagerly over all pairs.
 */
#[derive(Debug, Clone, Default)]
pub struct AliasOracle;

impl AliasOracle {
    pub fn new() -> Self {
        AliasOracle
    }

    pub fn alias(&self, function: &Function, a: Symbase, b: Symbase) -> AliasResult {
        if a == b {
            return AliasResult::MustAlias;
        }
        let declared = function
            .may_alias
            .iter()
            .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a));
        if declared {
            AliasResult::MayAlias
        } else {
            AliasResult::NoAlias
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meet_lattice() {
        assert_eq!(
            AliasResult::NoAlias.meet(AliasResult::MustAlias),
            AliasResult::NoAlias
        );
        assert_eq!(
            AliasResult::MustAlias.meet(AliasResult::MustAlias),
            AliasResult::MustAlias
        );
        assert_eq!(
            AliasResult::MayAlias.meet(AliasResult::MustAlias),
            AliasResult::MayAlias
        );
    }

    #[test]
    fn declared_pairs_may_alias() {
        let mut func = Function::new(String::from("f"));
        let a = func.intern_symbol("A", SymbolKind::Array);
        let b = func.intern_symbol("B", SymbolKind::Array);
        let c = func.intern_symbol("C", SymbolKind::Array);
        func.may_alias.push((a, b));
        let oracle = AliasOracle::new();
        assert_eq!(oracle.alias(&func, a, a), AliasResult::MustAlias);
        assert_eq!(oracle.alias(&func, a, b), AliasResult::MayAlias);
        assert_eq!(oracle.alias(&func, b, a), AliasResult::MayAlias);
        assert_eq!(oracle.alias(&func, a, c), AliasResult::NoAlias);
    }
}
