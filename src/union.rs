// SPDX-License-Identifier: BSD-3-Clause
//! Union-find over dense indices.

#[derive(Clone, Debug, Default)]
pub struct UnionFind {
    parents: Vec<usize>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `i` has a class.
    pub fn ensure(&mut self, i: usize) {
        while self.parents.len() <= i {
            let n = self.parents.len();
            self.parents.push(n);
        }
    }

    /// Representative without path compression, for shared access.
    pub fn find(&self, i: usize) -> usize {
        let mut current = i;
        while let Some(&p) = self.parents.get(current) {
            if p == current {
                break;
            }
            current = p;
        }
        current
    }

    /// Representative, halving the path on the way up.
    pub fn lookup(&mut self, i: usize) -> usize {
        self.ensure(i);
        let mut current = i;
        while self.parents[current] != current {
            let gp = self.parents[self.parents[current]];
            self.parents[current] = gp;
            current = gp;
        }
        current
    }

    // TODO: Merge by rank
    /// Returns true if the classes were distinct. The lesser representative
    /// becomes the parent.
    pub fn merge(&mut self, a: usize, b: usize) -> bool {
        if a == b {
            return false;
        }
        let ar = self.lookup(a);
        let br = self.lookup(b);
        if ar == br {
            return false;
        }
        let (less, greater) = if ar < br { (ar, br) } else { (br, ar) };
        self.parents[greater] = less;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_lookup() {
        let mut uf = UnionFind::new();
        assert_eq!(5, uf.lookup(5));
        assert!(uf.merge(5, 3));
        assert!(uf.merge(3, 8));
        assert!(!uf.merge(8, 5));
        assert_eq!(3, uf.lookup(8));
        assert_eq!(3, uf.find(5));
        assert_eq!(4, uf.find(4));
        assert_eq!(100, uf.find(100));
    }
}
