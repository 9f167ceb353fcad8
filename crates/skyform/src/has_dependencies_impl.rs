//! Implementations of HasDependencies for primitives and containers.

use crate::{self as sky, HasDependencies};

macro_rules! go {
    ($type: ty) => {
        impl HasDependencies for $type {}
    };
}

go!(String);
go!(u8);
go!(i8);
go!(u16);
go!(i16);
go!(u32);
go!(i32);
go!(u64);
go!(i64);
go!(f32);
go!(f64);
go!(bool);
go!(serde_json::Value);

skyform_derive::impl_has_dependencies_tuples!((A,));
skyform_derive::impl_has_dependencies_tuples!((A, B));
skyform_derive::impl_has_dependencies_tuples!((A, B, C));
skyform_derive::impl_has_dependencies_tuples!((A, B, C, D));
skyform_derive::impl_has_dependencies_tuples!((A, B, C, D, E));
skyform_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F));

fn fold<'a, T: HasDependencies + 'a>(items: impl Iterator<Item = &'a T>) -> sky::Dependencies {
    items.fold(sky::Dependencies::default(), |acc, item| {
        acc.merge(item.dependencies())
    })
}

impl<T: HasDependencies> HasDependencies for Vec<T> {
    fn dependencies(&self) -> sky::Dependencies {
        fold(self.iter())
    }
}

impl<V: HasDependencies> HasDependencies for Option<V> {
    fn dependencies(&self) -> sky::Dependencies {
        fold(self.iter())
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::HashMap<K, V> {
    fn dependencies(&self) -> sky::Dependencies {
        fold(self.values())
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::BTreeMap<K, V> {
    fn dependencies(&self) -> sky::Dependencies {
        fold(self.values())
    }
}

impl<V: HasDependencies> HasDependencies for std::collections::BTreeSet<V> {
    fn dependencies(&self) -> sky::Dependencies {
        fold(self.iter())
    }
}
