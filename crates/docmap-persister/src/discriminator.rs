//! Discriminator annotation of stored documents, embeds, and references.
//!
//! A discriminator records which concrete class a stored value holds when
//! the mapping alone cannot tell. Associations pinned to one target class
//! only carry the class's own discriminator, if it declares one.
//!
//! Value resolution for an unpinned association, first match wins:
//!
//! 1. the class's entry in the association's discriminator map,
//! 2. the association's default discriminator value,
//! 3. the class's own discriminator value, then its name.

use serde_json::{Map, Value as JsonValue};

use docmap_types::{ClassMetadata, TargetMapping};

use crate::error::PersistError;

/// Discriminator field used when neither the association nor the class names one.
pub const DEFAULT_DISCRIMINATOR_FIELD: &str = "_class";

/// Write the class's own discriminator into a top-level document.
pub fn annotate_document(class: &ClassMetadata, document: &mut Map<String, JsonValue>) {
    if let Some(field) = class.discriminator_field.as_deref() {
        document.insert(
            field.to_owned(),
            JsonValue::String(class.discriminator_value_or_name().to_owned()),
        );
    }
}

/// Write the discriminator of an embedded document of class `class`.
pub fn annotate_embedded(
    target: &TargetMapping,
    class: &ClassMetadata,
    document: &mut Map<String, JsonValue>,
) {
    if target.is_pinned() {
        annotate_document(class, document);
        return;
    }

    let field = target
        .discriminator_field
        .as_deref()
        .or(class.discriminator_field.as_deref())
        .unwrap_or(DEFAULT_DISCRIMINATOR_FIELD);
    let value = mapped_value(target, class)
        .unwrap_or_else(|| class.discriminator_value_or_name())
        .to_owned();
    tracing::trace!(class = %class.name, field, value = %value, "Annotating embedded document");
    document.insert(field.to_owned(), JsonValue::String(value));
}

/// Discriminator pair stored alongside a reference object, if any.
///
/// # Errors
///
/// Returns [`PersistError::UnlistedDiscriminator`] if the association names
/// a discriminator field and a non-empty map that lacks the class, with no
/// default value to fall back to.
pub fn reference_discriminator(
    target: &TargetMapping,
    class: &ClassMetadata,
    path: &str,
) -> Result<Option<(String, JsonValue)>, PersistError> {
    if target.is_pinned() {
        return Ok(class.discriminator_field.as_ref().map(|field| {
            (
                field.clone(),
                JsonValue::String(class.discriminator_value_or_name().to_owned()),
            )
        }));
    }

    if let Some(field) = target.discriminator_field.as_deref() {
        let value = match mapped_value(target, class) {
            Some(value) => value,
            None if target.discriminator_map.is_empty() => class.name.as_str(),
            None => {
                return Err(PersistError::UnlistedDiscriminator {
                    class: class.name.clone(),
                    path: path.to_owned(),
                });
            }
        };
        return Ok(Some((field.to_owned(), JsonValue::String(value.to_owned()))));
    }

    let field = class
        .discriminator_field
        .as_deref()
        .unwrap_or(DEFAULT_DISCRIMINATOR_FIELD);
    let value = mapped_value(target, class).unwrap_or_else(|| class.discriminator_value_or_name());
    Ok(Some((field.to_owned(), JsonValue::String(value.to_owned()))))
}

fn mapped_value<'a>(target: &'a TargetMapping, class: &ClassMetadata) -> Option<&'a str> {
    target
        .discriminator_for(&class.name)
        .or(target.default_discriminator_value.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rendered(document: Map<String, JsonValue>) -> JsonValue {
        JsonValue::Object(document)
    }

    #[test]
    fn documents_carry_their_class_discriminator() {
        let class = ClassMetadata::document("Admin", "users").discriminated("kind", "admin");
        let mut document = Map::new();
        annotate_document(&class, &mut document);
        assert_eq!(rendered(document), json!({"kind": "admin"}));
    }

    #[test]
    fn plain_documents_are_left_alone() {
        let class = ClassMetadata::document("User", "users");
        let mut document = Map::new();
        annotate_document(&class, &mut document);
        assert!(document.is_empty());
    }

    #[test]
    fn pinned_embeds_skip_the_association_discriminator() {
        let class = ClassMetadata::embedded("Address");
        let mut document = Map::new();
        annotate_embedded(&TargetMapping::pinned("Address"), &class, &mut document);
        assert!(document.is_empty());
    }

    #[test]
    fn unpinned_embeds_use_map_then_class_name() {
        let target = TargetMapping::polymorphic()
            .discriminated_by("type")
            .map_discriminator("home", "HomeAddress");

        let mut home = Map::new();
        annotate_embedded(&target, &ClassMetadata::embedded("HomeAddress"), &mut home);
        assert_eq!(rendered(home), json!({"type": "home"}));

        let mut work = Map::new();
        annotate_embedded(&target, &ClassMetadata::embedded("WorkAddress"), &mut work);
        assert_eq!(rendered(work), json!({"type": "WorkAddress"}));
    }

    #[test]
    fn unpinned_embeds_default_the_field_name() {
        let mut document = Map::new();
        annotate_embedded(
            &TargetMapping::polymorphic(),
            &ClassMetadata::embedded("Phone"),
            &mut document,
        );
        assert_eq!(rendered(document), json!({"_class": "Phone"}));
    }

    #[test]
    fn unlisted_reference_class_is_an_error() {
        let target = TargetMapping::polymorphic()
            .discriminated_by("type")
            .map_discriminator("post", "Post");
        let result = reference_discriminator(&target, &ClassMetadata::document("Video", "videos"), "items.0");
        assert!(matches!(result, Err(PersistError::UnlistedDiscriminator { .. })));
    }

    #[test]
    fn unlisted_reference_class_uses_default_value() {
        let target = TargetMapping::polymorphic()
            .discriminated_by("type")
            .map_discriminator("post", "Post")
            .default_discriminator("media");
        let result = reference_discriminator(&target, &ClassMetadata::document("Video", "videos"), "item");
        assert_eq!(
            result.ok().flatten(),
            Some(("type".to_owned(), json!("media")))
        );
    }

    #[test]
    fn pinned_references_carry_no_discriminator() {
        let result = reference_discriminator(
            &TargetMapping::pinned("User"),
            &ClassMetadata::document("User", "users"),
            "owner",
        );
        assert!(matches!(result, Ok(None)));
    }
}
