use crate::class_file::TypeInfo;
use crate::code::{Label, ResolvedOffsets};
use crate::errors::Error;
use crate::pool::ConstantPool;

/// Type in the verifier's lattice.
///
/// This is the rich form used during abstract interpretation: object types
/// carry their binary name and uninitialized types remember the `new` site
/// that produced them. The wire form ([`TypeInfo`]) is only produced once
/// offsets are final, via [`VerificationType::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationType {
    /// Either an unusable slot or the upper half of a two-word value
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Instance of the named class (or, when the name starts with `[`, the
    /// named array type)
    Object(String),
    /// Freshly allocated instance whose constructor has not run yet
    Uninitialized { class: String, new_site: Label },
}

impl VerificationType {
    /// Words the value occupies on the stack or in locals
    pub fn width(&self) -> usize {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }

    /// Immediate parent in the lattice. Every chain ends at `Top`, which has
    /// no parent.
    pub fn parent(&self) -> Option<VerificationType> {
        match self {
            VerificationType::Top => None,
            VerificationType::Object(name) if name != "java/lang/Object" => {
                Some(VerificationType::Object("java/lang/Object".to_owned()))
            }
            VerificationType::Null => {
                Some(VerificationType::Object("java/lang/Object".to_owned()))
            }
            _ => Some(VerificationType::Top),
        }
    }

    /// Whether a value of type `self` can stand in where `target` is wanted.
    ///
    /// The pool carries no class hierarchy, so distinct object types are
    /// only related through `java/lang/Object`. `Null` is assignable to any
    /// object type.
    pub fn is_assignable_to(&self, target: &VerificationType) -> bool {
        if self == target || *target == VerificationType::Top {
            return true;
        }
        match (self, target) {
            (VerificationType::Null, VerificationType::Object(_)) => true,
            (VerificationType::Object(_), VerificationType::Object(name)) => {
                name == "java/lang/Object"
            }
            _ => false,
        }
    }

    /// Join of two types: the cheapest common ancestor in the lattice
    pub fn unify(&self, other: &VerificationType) -> VerificationType {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (VerificationType::Null, VerificationType::Object(name))
            | (VerificationType::Object(name), VerificationType::Null) => {
                VerificationType::Object(name.clone())
            }
            (VerificationType::Object(_), VerificationType::Object(_)) => {
                VerificationType::Object("java/lang/Object".to_owned())
            }
            _ => VerificationType::Top,
        }
    }

    /// Lower into the wire form, interning class entries as needed
    pub fn resolve(
        &self,
        pool: &mut ConstantPool,
        offsets: &ResolvedOffsets,
    ) -> Result<TypeInfo, Error> {
        let resolved = match self {
            VerificationType::Top => TypeInfo::Top,
            VerificationType::Integer => TypeInfo::Integer,
            VerificationType::Float => TypeInfo::Float,
            VerificationType::Long => TypeInfo::Long,
            VerificationType::Double => TypeInfo::Double,
            VerificationType::Null => TypeInfo::Null,
            VerificationType::UninitializedThis => TypeInfo::UninitializedThis,
            VerificationType::Object(name) => TypeInfo::Object(pool.class(name)?),
            VerificationType::Uninitialized { new_site, .. } => {
                TypeInfo::Uninitialized(offsets.offset_of(*new_site)?)
            }
        };
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str) -> VerificationType {
        VerificationType::Object(name.to_owned())
    }

    #[test]
    fn widths() {
        assert_eq!(VerificationType::Long.width(), 2);
        assert_eq!(VerificationType::Double.width(), 2);
        assert_eq!(VerificationType::Integer.width(), 1);
        assert_eq!(object("java/lang/String").width(), 1);
    }

    #[test]
    fn parent_chains_end_at_top() {
        let mut ty = object("java/lang/String");
        let mut hops = 0;
        while let Some(parent) = ty.parent() {
            ty = parent;
            hops += 1;
            assert!(hops < 10);
        }
        assert_eq!(ty, VerificationType::Top);
    }

    #[test]
    fn null_is_assignable_to_objects() {
        assert!(VerificationType::Null.is_assignable_to(&object("java/lang/String")));
        assert!(!VerificationType::Null.is_assignable_to(&VerificationType::Integer));
    }

    #[test]
    fn everything_is_assignable_to_top() {
        assert!(VerificationType::Long.is_assignable_to(&VerificationType::Top));
        assert!(object("java/lang/String").is_assignable_to(&VerificationType::Top));
    }

    #[test]
    fn unify_unrelated_objects() {
        assert_eq!(
            object("java/lang/String").unify(&object("java/io/PrintStream")),
            object("java/lang/Object"),
        );
        assert_eq!(
            object("java/lang/String").unify(&VerificationType::Null),
            object("java/lang/String"),
        );
        assert_eq!(
            object("java/lang/String").unify(&VerificationType::Integer),
            VerificationType::Top,
        );
    }
}
