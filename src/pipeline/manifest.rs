//! Key Object Selection manifest listing every instance of a series.

use dicom_core::value::{DataSetSequence, Value};
use dicom_core::{DataElement, Length, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::mem::InMemElement;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use snafu::prelude::*;

use crate::aggregate::SeriesSnapshot;
use crate::anonymize::STANDARD_UID_ROOT;
use crate::registry::IdentityRegistry;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("instance {sop_instance_uid} has no SOP Class UID"))]
    MissingSopClass { sop_instance_uid: String },

    #[snafu(display("could not build file meta group"))]
    Meta { source: dicom_object::WithMetaError },
}

fn sequence(items: Vec<InMemDicomObject>) -> Value<InMemDicomObject> {
    Value::from(DataSetSequence::new(items, Length::UNDEFINED))
}

fn text(obj: &mut InMemDicomObject, tag: dicom_core::Tag, vr: VR, value: impl Into<String>) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value.into())));
}

fn code(value: &str, scheme: &str, meaning: &str) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    text(&mut item, tags::CODE_VALUE, VR::SH, value);
    text(&mut item, tags::CODING_SCHEME_DESIGNATOR, VR::SH, scheme);
    text(&mut item, tags::CODE_MEANING, VR::LO, meaning);
    item
}

/// Build the manifest of `snapshot`.
///
/// With a pseudonym, the referenced UIDs and the patient identity are the
/// substitutes the anonymizer will produce for the same instances, so the
/// manifest agrees with the anonymized series it announces.
pub fn build_manifest(
    snapshot: &SeriesSnapshot,
    registry: &IdentityRegistry,
    pseudonym: Option<&str>,
) -> Result<DefaultDicomObject, Error> {
    let map = |uid: &str| match pseudonym {
        Some(p) => registry.substitute_uid(p, uid),
        None => uid.to_string(),
    };
    let map_class = |uid: &str| {
        if uid.starts_with(STANDARD_UID_ROOT) {
            uid.to_string()
        } else {
            map(uid)
        }
    };

    let mut referenced = Vec::with_capacity(snapshot.files.len());
    let mut content = Vec::with_capacity(snapshot.files.len());
    for file in snapshot.files.iter() {
        let sop_class = file
            .sop_class_uid
            .as_deref()
            .with_context(|| MissingSopClassSnafu {
                sop_instance_uid: file.sop_instance_uid.clone(),
            })?;
        let mut reference = InMemDicomObject::new_empty();
        text(&mut reference, tags::REFERENCED_SOP_CLASS_UID, VR::UI, map_class(sop_class));
        text(
            &mut reference,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            map(&file.sop_instance_uid),
        );

        let mut item = InMemDicomObject::new_empty();
        text(&mut item, tags::RELATIONSHIP_TYPE, VR::CS, "CONTAINS");
        text(&mut item, tags::VALUE_TYPE, VR::CS, "IMAGE");
        item.put(InMemElement::new(
            tags::REFERENCED_SOP_SEQUENCE,
            VR::SQ,
            sequence(vec![reference.clone()]),
        ));
        content.push(item);
        referenced.push(reference);
    }

    let study_uid = map(&snapshot.study_uid);
    let mut series_item = InMemDicomObject::new_empty();
    text(&mut series_item, tags::SERIES_INSTANCE_UID, VR::UI, map(&snapshot.series_uid));
    series_item.put(InMemElement::new(
        tags::REFERENCED_SOP_SEQUENCE,
        VR::SQ,
        sequence(referenced),
    ));
    let mut study_item = InMemDicomObject::new_empty();
    text(&mut study_item, tags::STUDY_INSTANCE_UID, VR::UI, study_uid.clone());
    study_item.put(InMemElement::new(
        tags::REFERENCED_SERIES_SEQUENCE,
        VR::SQ,
        sequence(vec![series_item]),
    ));

    let sop_instance_uid = registry.mint_uid();
    let mut obj = InMemDicomObject::new_empty();
    text(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE);
    text(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.clone());
    text(&mut obj, tags::MODALITY, VR::CS, "KO");
    match pseudonym {
        Some(p) => {
            text(&mut obj, tags::PATIENT_ID, VR::LO, p);
            text(&mut obj, tags::PATIENT_NAME, VR::PN, p);
        }
        None => {
            text(&mut obj, tags::PATIENT_ID, VR::LO, snapshot.patient_id.clone());
            if let Some(name) = &snapshot.patient_name {
                text(&mut obj, tags::PATIENT_NAME, VR::PN, name.clone());
            }
        }
    }
    text(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study_uid);
    text(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, registry.mint_uid());
    text(&mut obj, tags::SERIES_NUMBER, VR::IS, "9999");
    text(&mut obj, tags::INSTANCE_NUMBER, VR::IS, "1");
    text(&mut obj, tags::VALUE_TYPE, VR::CS, "CONTAINER");
    text(&mut obj, tags::CONTINUITY_OF_CONTENT, VR::CS, "SEPARATE");
    obj.put(InMemElement::new(
        tags::CONCEPT_NAME_CODE_SEQUENCE,
        VR::SQ,
        sequence(vec![code("113030", "DCM", "Manifest")]),
    ));
    obj.put(InMemElement::new(
        tags::CURRENT_REQUESTED_PROCEDURE_EVIDENCE_SEQUENCE,
        VR::SQ,
        sequence(vec![study_item]),
    ));
    obj.put(InMemElement::new(tags::CONTENT_SEQUENCE, VR::SQ, sequence(content)));

    obj.with_meta(
        FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid()),
    )
    .context(MetaSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{InstanceFile, SeriesSummary};
    use crate::registry::RegistryConfig;
    use crate::utils::element_string;
    use std::sync::Arc;

    fn snapshot() -> SeriesSnapshot {
        let files: Vec<InstanceFile> = (1..=3)
            .map(|n| InstanceFile {
                path: format!("/data/{n}.dcm").into(),
                sop_instance_uid: format!("1.2.3.{n}"),
                sop_class_uid: Some(uids::CT_IMAGE_STORAGE.to_string()),
                instance_number: n,
            })
            .collect();
        SeriesSnapshot {
            series_uid: "1.2.3".to_string(),
            patient_id: "JDOE123".to_string(),
            patient_name: Some("Doe^John".to_string()),
            study_uid: "1.2".to_string(),
            summary: SeriesSummary::default(),
            files: Arc::from(files),
        }
    }

    fn referenced_uids(obj: &InMemDicomObject) -> Vec<String> {
        obj.element(tags::CONTENT_SEQUENCE)
            .unwrap()
            .items()
            .unwrap()
            .iter()
            .map(|item| {
                let reference = &item.element(tags::REFERENCED_SOP_SEQUENCE).unwrap().items().unwrap()[0];
                element_string(reference, tags::REFERENCED_SOP_INSTANCE_UID).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_manifest_references_series() {
        let registry = IdentityRegistry::with_seed(RegistryConfig::default(), 1).unwrap();
        let manifest = build_manifest(&snapshot(), &registry, None).unwrap();
        assert_eq!(
            element_string(&manifest, tags::SOP_CLASS_UID).as_deref(),
            Some(uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE)
        );
        assert_eq!(element_string(&manifest, tags::PATIENT_ID).as_deref(), Some("JDOE123"));
        assert_eq!(referenced_uids(&manifest), vec!["1.2.3.1", "1.2.3.2", "1.2.3.3"]);
        assert_eq!(
            manifest.meta().media_storage_sop_instance_uid.trim_end_matches('\0'),
            element_string(&manifest, tags::SOP_INSTANCE_UID).unwrap()
        );
    }

    #[test]
    fn test_manifest_uses_substitutes() {
        let registry = IdentityRegistry::with_seed(RegistryConfig::default(), 1).unwrap();
        let manifest = build_manifest(&snapshot(), &registry, Some("ANON0001")).unwrap();
        assert_eq!(element_string(&manifest, tags::PATIENT_ID).as_deref(), Some("ANON0001"));
        let referenced = referenced_uids(&manifest);
        assert_eq!(
            registry.lookup_uid("ANON0001", "1.2.3.1").as_deref(),
            Some(referenced[0].as_str())
        );
        assert_eq!(
            element_string(&manifest, tags::STUDY_INSTANCE_UID),
            registry.lookup_uid("ANON0001", "1.2")
        );
    }

    #[test]
    fn test_instances_under_standard_root_are_mapped() {
        let registry = IdentityRegistry::with_seed(RegistryConfig::default(), 1).unwrap();
        let mut snapshot = snapshot();
        let mut files = snapshot.files.to_vec();
        files[0].sop_instance_uid = "1.2.840.10008.9.9".to_string();
        snapshot.files = Arc::from(files);
        let manifest = build_manifest(&snapshot, &registry, Some("ANON0001")).unwrap();

        let referenced = referenced_uids(&manifest);
        assert_ne!(referenced[0], "1.2.840.10008.9.9");
        assert_eq!(
            registry.lookup_uid("ANON0001", "1.2.840.10008.9.9").as_deref(),
            Some(referenced[0].as_str())
        );
        let item = &manifest.element(tags::CONTENT_SEQUENCE).unwrap().items().unwrap()[0];
        let reference = &item.element(tags::REFERENCED_SOP_SEQUENCE).unwrap().items().unwrap()[0];
        assert_eq!(
            element_string(reference, tags::REFERENCED_SOP_CLASS_UID).as_deref(),
            Some(uids::CT_IMAGE_STORAGE)
        );
    }

    #[test]
    fn test_missing_sop_class() {
        let registry = IdentityRegistry::with_seed(RegistryConfig::default(), 1).unwrap();
        let mut snapshot = snapshot();
        let mut files = snapshot.files.to_vec();
        files[1].sop_class_uid = None;
        snapshot.files = Arc::from(files);
        assert!(matches!(
            build_manifest(&snapshot, &registry, None),
            Err(Error::MissingSopClass { .. })
        ));
    }
}
