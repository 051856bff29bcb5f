use crate::*;

/*
 * The maximum loop nest depth representable anywhere in the IR. Subscript
 * expressions, direction vectors and distance vectors are all fixed-capacity
 * arrays of this length, indexed by 1-based nesting level.
 */
pub const MAX_LOOP_NEST_LEVEL: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobID(u32);

impl BlobID {
    pub fn new(x: usize) -> Self {
        BlobID(x as u32)
    }

    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

/*
 * Canonical affine form for subscripts and loop bounds: a sum of induction
 * variable terms (one coefficient per nesting level), blob terms (opaque
 * symbolic temporaries folded into the subscript), and a constant. The
 * dependence test only ever needs the linear structure, so non-affine
 * expressions never reach this type - the parser rejects them.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonExpr {
    iv_coeffs: [i64; MAX_LOOP_NEST_LEVEL],
    blob_coeffs: Vec<(BlobID, i64)>,
    constant: i64,
}

impl CanonExpr {
    pub fn new() -> Self {
        CanonExpr {
            iv_coeffs: [0; MAX_LOOP_NEST_LEVEL],
            blob_coeffs: vec![],
            constant: 0,
        }
    }

    pub fn from_const(c: i64) -> Self {
        let mut expr = CanonExpr::new();
        expr.constant = c;
        expr
    }

    pub fn from_iv(level: u32, coeff: i64) -> Self {
        let mut expr = CanonExpr::new();
        expr.add_iv(level, coeff);
        expr
    }

    /*
     * Accumulating constructors. Levels are 1-based, like everywhere else in
     * the engine; level 0 or a level past the capacity is a caller bug.
     */
    pub fn add_iv(&mut self, level: u32, coeff: i64) {
        assert!(
            level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL,
            "IV level out of range."
        );
        self.iv_coeffs[level as usize - 1] += coeff;
    }

    pub fn add_blob(&mut self, blob: BlobID, coeff: i64) {
        // Blob coefficient lists are kept sorted by blob index, so equality
        // of two lists is equality of the symbolic parts.
        match self.blob_coeffs.binary_search_by_key(&blob, |(b, _)| *b) {
            Ok(pos) => self.blob_coeffs[pos].1 += coeff,
            Err(pos) => self.blob_coeffs.insert(pos, (blob, coeff)),
        }
        self.blob_coeffs.retain(|(_, c)| *c != 0);
    }

    pub fn add_const(&mut self, c: i64) {
        self.constant += c;
    }

    pub fn iv_coeff(&self, level: u32) -> i64 {
        assert!(
            level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL,
            "IV level out of range."
        );
        self.iv_coeffs[level as usize - 1]
    }

    pub fn blob_coeffs(&self) -> &[(BlobID, i64)] {
        &self.blob_coeffs
    }

    pub fn constant(&self) -> i64 {
        self.constant
    }

    /*
     * A bound or subscript is a plain integer exactly when no IV and no blob
     * appears in it. The dependence test folds such bounds into trip counts.
     */
    pub fn as_const(&self) -> Option<i64> {
        if self.blob_coeffs.is_empty() && self.iv_coeffs.iter().all(|c| *c == 0) {
            Some(self.constant)
        } else {
            None
        }
    }

    pub fn has_blobs(&self) -> bool {
        !self.blob_coeffs.is_empty()
    }

    /// Deepest level whose IV appears with a nonzero coefficient, or 0 if
    /// the expression is loop invariant.
    pub fn deepest_iv_level(&self) -> u32 {
        for level in (1..=MAX_LOOP_NEST_LEVEL as u32).rev() {
            if self.iv_coeff(level) != 0 {
                return level;
            }
        }
        0
    }

    pub fn varies_at(&self, level: u32) -> bool {
        self.iv_coeff(level) != 0
    }
}

impl Default for CanonExpr {
    fn default() -> Self {
        CanonExpr::new()
    }
}

impl std::fmt::Display for CanonExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut term = |f: &mut std::fmt::Formatter<'_>, coeff: i64, name: String| {
            if coeff == 0 {
                return Ok(());
            }
            if first {
                first = false;
                if coeff == -1 {
                    write!(f, "-{}", name)?;
                } else if coeff == 1 {
                    write!(f, "{}", name)?;
                } else {
                    write!(f, "{} * {}", coeff, name)?;
                }
            } else if coeff.abs() == 1 {
                write!(f, " {} {}", if coeff > 0 { "+" } else { "-" }, name)?;
            } else {
                write!(
                    f,
                    " {} {} * {}",
                    if coeff > 0 { "+" } else { "-" },
                    coeff.abs(),
                    name
                )?;
            }
            Ok(())
        };
        for level in 1..=MAX_LOOP_NEST_LEVEL as u32 {
            term(f, self.iv_coeff(level), format!("i{}", level))?;
        }
        for (blob, coeff) in self.blob_coeffs.iter() {
            term(f, *coeff, format!("%b{}", blob.idx()))?;
        }
        if first {
            write!(f, "{}", self.constant)?;
        } else if self.constant > 0 {
            write!(f, " + {}", self.constant)?;
        } else if self.constant < 0 {
            write!(f, " - {}", -self.constant)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_bound_detection() {
        assert_eq!(CanonExpr::from_const(7).as_const(), Some(7));
        let mut expr = CanonExpr::from_const(7);
        expr.add_iv(2, 3);
        assert_eq!(expr.as_const(), None);
        assert_eq!(expr.deepest_iv_level(), 2);
        assert!(expr.varies_at(2));
        assert!(!expr.varies_at(1));
    }

    #[test]
    fn blob_terms_cancel() {
        let mut expr = CanonExpr::new();
        expr.add_blob(BlobID::new(3), 2);
        expr.add_blob(BlobID::new(3), -2);
        assert!(!expr.has_blobs());
        assert_eq!(expr.as_const(), Some(0));
    }

    #[test]
    fn rendering() {
        let mut expr = CanonExpr::from_iv(1, 2);
        expr.add_iv(2, -1);
        expr.add_const(4);
        assert_eq!(expr.to_string(), "2 * i1 - i2 + 4");
        assert_eq!(CanonExpr::from_const(0).to_string(), "0");
    }
}
