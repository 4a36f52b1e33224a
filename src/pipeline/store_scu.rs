//! C-STORE service user pushing batches over one association each.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{DefaultDicomObject, InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom_ul::{ClientAssociation, ClientAssociationOptions, Pdu};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::push::{
    ArchivePush, AssociationSnafu, CancelledSnafu, ConvertFieldSnafu, CreateCommandSnafu,
    MissingAttributeSnafu, NoPresentationContextSnafu, PushError, ReadResponseSnafu,
    RejectedSnafu, SendSnafu, StreamDataSnafu, UnexpectedPduSnafu,
    UnsupportedTransferSyntaxSnafu, WriteDatasetSnafu,
};

pub const DEFAULT_CALLING_AE_TITLE: &str = "DICOM-ANON";
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16_384;

/// Pushes to a Storage SCP addressed as `AE@host:port`.
#[derive(Debug, Clone)]
pub struct StoreScuPush {
    /// the calling Application Entity title
    pub calling_ae_title: String,
    /// the maximum PDU length accepted by this SCU
    pub max_pdu_length: u32,
}

impl Default for StoreScuPush {
    fn default() -> Self {
        StoreScuPush {
            calling_ae_title: DEFAULT_CALLING_AE_TITLE.to_string(),
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
        }
    }
}

/// Identity of one object about to be sent.
struct Outgoing<'a> {
    file: &'a DefaultDicomObject,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax: String,
}

impl<'a> Outgoing<'a> {
    fn new(file: &'a DefaultDicomObject) -> Self {
        let meta = file.meta();
        Outgoing {
            file,
            sop_class_uid: meta.media_storage_sop_class_uid.trim_end_matches('\0').to_string(),
            sop_instance_uid: meta
                .media_storage_sop_instance_uid
                .trim_end_matches('\0')
                .to_string(),
            transfer_syntax: meta.transfer_syntax().trim_end_matches('\0').to_string(),
        }
    }
}

#[async_trait]
impl ArchivePush for StoreScuPush {
    async fn push(&self, destination: &str, batch: &[DefaultDicomObject]) -> Result<(), PushError> {
        if batch.is_empty() {
            return Ok(());
        }
        let outgoing: Vec<Outgoing> = batch.iter().map(Outgoing::new).collect();

        let mut scu_init = ClientAssociationOptions::new()
            .calling_ae_title(self.calling_ae_title.clone())
            .max_pdu_length(self.max_pdu_length);
        for (sop_class_uid, transfer_syntax) in presentation_contexts(&outgoing) {
            scu_init = scu_init.with_presentation_context(sop_class_uid, vec![transfer_syntax]);
        }

        debug!("Establishing association with '{}'...", destination);
        let mut scu = scu_init
            .establish_with_async(destination)
            .await
            .map_err(Box::from)
            .context(AssociationSnafu { destination })?;

        let mut message_id = 1;
        for object in &outgoing {
            if let Err(e) = send_object(&mut scu, object, message_id).await {
                let _ = scu.abort().await;
                return Err(e);
            }
            message_id += 1;
        }

        let _ = scu.release().await;
        info!("Pushed {} instance(s) to {}", outgoing.len(), destination);
        Ok(())
    }
}

/// Pairs of (SOP class, transfer syntax) to propose. Objects in a codec-free
/// transfer syntax can be re-encoded in either little endian syntax, so those
/// are proposed as well.
fn presentation_contexts(outgoing: &[Outgoing]) -> BTreeSet<(String, String)> {
    let mut contexts = BTreeSet::new();
    for object in outgoing {
        contexts.insert((object.sop_class_uid.clone(), object.transfer_syntax.clone()));
        let codec_free = TransferSyntaxRegistry
            .get(&object.transfer_syntax)
            .map(|ts| ts.is_codec_free())
            .unwrap_or(false);
        if codec_free {
            contexts.insert((
                object.sop_class_uid.clone(),
                uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ));
            contexts.insert((
                object.sop_class_uid.clone(),
                uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ));
        }
    }
    contexts
}

/// Pick an accepted presentation context for `object`: the exact transfer
/// syntax if the archive took it, otherwise any codec-free one when the
/// object itself is codec-free. Returns the context id and its transfer
/// syntax.
fn select_context(
    object: &Outgoing,
    pcs: &[PresentationContextNegotiated],
) -> Result<(u8, String), PushError> {
    choose_context(
        object,
        pcs.iter()
            .map(|pc| (pc.id, pc.abstract_syntax.as_str(), pc.transfer_syntax.as_str())),
    )
}

fn choose_context<'p>(
    object: &Outgoing,
    accepted: impl Iterator<Item = (u8, &'p str, &'p str)> + Clone,
) -> Result<(u8, String), PushError> {
    let file_ts = TransferSyntaxRegistry
        .get(&object.transfer_syntax)
        .with_context(|| UnsupportedTransferSyntaxSnafu {
            uid: object.transfer_syntax.clone(),
        })?;

    let for_class = || {
        accepted
            .clone()
            .filter(|(_, abstract_syntax, _)| *abstract_syntax == object.sop_class_uid)
    };

    if let Some((id, _, ts)) = for_class().find(|(_, _, ts)| *ts == file_ts.uid()) {
        return Ok((id, ts.to_string()));
    }
    for_class()
        .find(|(_, _, ts)| {
            file_ts.is_codec_free()
                && TransferSyntaxRegistry
                    .get(ts)
                    .map(|ts| ts.is_codec_free())
                    .unwrap_or(false)
        })
        .map(|(id, _, ts)| (id, ts.to_string()))
        .with_context(|| NoPresentationContextSnafu {
            sop_class_uid: object.sop_class_uid.clone(),
            transfer_syntax: object.transfer_syntax.clone(),
        })
}

fn store_req_command(
    storage_sop_class_uid: &str,
    storage_sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        // SOP Class UID
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_class_uid),
        ),
        // command field
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        // message ID
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        // priority
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        // data set type
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        // affected SOP Instance UID
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_instance_uid),
        ),
    ])
}

async fn send_object(
    scu: &mut ClientAssociation<TcpStream>,
    object: &Outgoing<'_>,
    message_id: u16,
) -> Result<(), PushError> {
    let (pc_id, ts_uid) = select_context(object, scu.presentation_contexts())?;
    let ts_selected = TransferSyntaxRegistry
        .get(&ts_uid)
        .with_context(|| UnsupportedTransferSyntaxSnafu { uid: ts_uid.clone() })?;

    let cmd = store_req_command(&object.sop_class_uid, &object.sop_instance_uid, message_id);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(
        &mut cmd_data,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map_err(Box::from)
    .context(CreateCommandSnafu)?;

    let mut object_data = Vec::with_capacity(2048);
    object
        .file
        .write_dataset_with_ts(&mut object_data, ts_selected)
        .map_err(Box::from)
        .context(WriteDatasetSnafu)?;

    let nbytes = cmd_data.len() + object_data.len();
    debug!(
        "Sending instance {} (~ {} kB), sop={}, ts={}",
        object.sop_instance_uid,
        nbytes / 1_000,
        object.sop_class_uid,
        ts_uid,
    );

    if nbytes < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_data,
                },
                PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: object_data,
                },
            ],
        };
        scu.send(&pdu).await.map_err(Box::from).context(SendSnafu)?;
    } else {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        };
        scu.send(&pdu).await.map_err(Box::from).context(SendSnafu)?;

        let mut pdata = scu.send_pdata(pc_id).await;
        pdata.write_all(&object_data).await.context(StreamDataSnafu)?;
    }

    let rsp_pdu = scu.receive().await.map_err(Box::from).context(SendSnafu)?;
    let data = match rsp_pdu {
        Pdu::PData { data } if !data.is_empty() => data,
        pdu => {
            return UnexpectedPduSnafu {
                pdu: format!("{:?}", pdu),
            }
            .fail()
        }
    };

    let cmd_obj = InMemDicomObject::read_dataset_with_ts(
        &data[0].data[..],
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .context(ReadResponseSnafu)?;
    let status = cmd_obj
        .element(tags::STATUS)
        .context(MissingAttributeSnafu { tag: tags::STATUS })?
        .to_int::<u16>()
        .context(ConvertFieldSnafu { tag: tags::STATUS })?;

    interpret_status(&object.sop_instance_uid, status)
}

/// Map a C-STORE response status to the outcome of the store.
fn interpret_status(sop_instance_uid: &str, status: u16) -> Result<(), PushError> {
    match status {
        // Success
        0 => {
            debug!("Stored instance {}", sop_instance_uid);
            Ok(())
        }
        // Warning
        1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => {
            warn!(
                "Possible issue storing instance `{}` (status code {:04X}H)",
                sop_instance_uid, status
            );
            Ok(())
        }
        0xFF00 | 0xFF01 => {
            warn!(
                "Possible issue storing instance `{}`: status is pending (status code {:04X}H)",
                sop_instance_uid, status
            );
            Ok(())
        }
        0xFE00 => CancelledSnafu { sop_instance_uid }.fail(),
        _ => RejectedSnafu {
            sop_instance_uid,
            status,
        }
        .fail(),
    }
}
