//! Property-based test generators using proptest.
//!
//! Graph strategies produce a plain description ([`GraphSpec`]) that is
//! turned into detached objects with [`GraphSpec::build`], so failing cases
//! shrink on indices rather than on live objects.

use crate::fixtures::{dog, person};
use proptest::prelude::*;
use tetherdb_core::{Object, Value};

/// Strategy for generating property-safe names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for generating scalar values. Doubles are always finite.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9..1.0e9f64).prop_map(Value::Double),
        name_strategy().prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
    ]
}

/// One person in a generated graph. The person's id is its index.
#[derive(Debug, Clone)]
pub struct PersonSpec {
    /// Name.
    pub name: String,
    /// Age.
    pub age: i64,
    /// Index into [`GraphSpec::dogs`].
    pub dog: Option<usize>,
    /// Indices of friends. May repeat and may include the person itself.
    pub friends: Vec<usize>,
}

/// One dog in a generated graph.
#[derive(Debug, Clone)]
pub struct DogSpec {
    /// Name.
    pub name: String,
    /// Index of the owning person.
    pub owner: Option<usize>,
}

/// Description of a detached `Person`/`Dog` graph.
#[derive(Debug, Clone)]
pub struct GraphSpec {
    /// People, with ids `0..people.len()`.
    pub people: Vec<PersonSpec>,
    /// Dogs, possibly shared by several people.
    pub dogs: Vec<DogSpec>,
}

impl GraphSpec {
    /// Builds the graph, returning the people in id order.
    ///
    /// Every schema field is set, so the graph has the same shape as its
    /// unbounded copy out of a store.
    pub fn build(&self) -> Vec<Object> {
        let people: Vec<Object> = self
            .people
            .iter()
            .enumerate()
            .map(|(id, spec)| {
                let object = person(id as i64, &spec.name);
                object.set("age", spec.age);
                object
            })
            .collect();
        let dogs: Vec<Object> = self.dogs.iter().map(|spec| dog(&spec.name)).collect();

        for (object, spec) in dogs.iter().zip(&self.dogs) {
            object.set_link("owner", spec.owner.map(|i| &people[i]));
        }
        for (object, spec) in people.iter().zip(&self.people) {
            object.set_link("dog", spec.dog.map(|i| &dogs[i]));
            object.set_list("friends", spec.friends.iter().map(|&i| people[i].clone()).collect());
        }
        people
    }
}

/// Strategy for graphs of `1..=max_people` people and up to as many dogs.
pub fn graph_spec_strategy(max_people: usize) -> impl Strategy<Value = GraphSpec> {
    (1..=max_people.max(1), 0..=max_people).prop_flat_map(|(people, dogs)| {
        let person = (
            name_strategy(),
            0..120i64,
            prop::option::of(0..dogs.max(1)),
            prop::collection::vec(0..people, 0..4),
        )
            .prop_map(move |(name, age, dog, friends)| PersonSpec {
                name,
                age,
                dog: dog.filter(|_| dogs > 0),
                friends,
            });
        let dog = (name_strategy(), prop::option::of(0..people))
            .prop_map(|(name, owner)| DogSpec { name, owner });
        (
            prop::collection::vec(person, people),
            prop::collection::vec(dog, dogs),
        )
            .prop_map(|(people, dogs)| GraphSpec { people, dogs })
    })
}

/// One step of a handle acquire/release sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCountOp {
    /// Open another handle.
    Acquire,
    /// Release the most recently opened handle, if any.
    Release,
}

/// Strategy for acquire/release sequences.
pub fn ref_count_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<RefCountOp>> {
    prop::collection::vec(
        prop_oneof![Just(RefCountOp::Acquire), Just(RefCountOp::Release)],
        0..max_len,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::release_graph;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn graph_indices_are_in_range(spec in graph_spec_strategy(6)) {
            let people = spec.people.len();
            for p in &spec.people {
                prop_assert!(p.friends.iter().all(|&i| i < people));
                prop_assert!(p.dog.map_or(true, |i| i < spec.dogs.len()));
            }
            for d in &spec.dogs {
                prop_assert!(d.owner.map_or(true, |i| i < people));
            }
        }

        #[test]
        fn built_graph_has_every_field(spec in graph_spec_strategy(5)) {
            let people = spec.build();
            prop_assert_eq!(people.len(), spec.people.len());
            for (id, p) in people.iter().enumerate() {
                prop_assert_eq!(p.get("id"), Some(Value::Integer(id as i64)));
                for field in ["name", "age", "dog", "friends"] {
                    prop_assert!(p.has_field(field));
                }
            }
            release_graph(&people);
        }

        #[test]
        fn doubles_are_finite(value in value_strategy()) {
            if let Value::Double(d) = value {
                prop_assert!(d.is_finite());
            }
        }
    }
}
