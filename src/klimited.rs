// SPDX-License-Identifier: BSD-3-Clause
//! k-limited call strings, most recent call first.
use std::collections::VecDeque;
use std::fmt::Display;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KLimited<T> {
    k: usize,
    elems: VecDeque<T>,
}

impl<T> KLimited<T> {
    pub fn new(k: usize, initial_elems: Vec<T>) -> Self {
        let mut elems = if k < 8 {
            VecDeque::with_capacity(k)
        } else {
            VecDeque::new()
        };
        elems.extend(initial_elems);
        elems.truncate(k);
        KLimited { k, elems }
    }

    pub fn push(&mut self, t: T) {
        if self.elems.len() >= self.k {
            self.elems.pop_back();
        }
        if self.k > 0 {
            self.elems.push_front(t);
        }
    }

    pub fn pushed(&self, t: T) -> Self
    where
        T: Clone,
    {
        let mut new = self.clone();
        new.push(t);
        new
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elems.iter()
    }
}

impl<T: Display> Display for KLimited<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, t) in self.elems.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, "]")
    }
}
