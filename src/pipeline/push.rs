//! The seam between the pipeline and the remote archive.

use async_trait::async_trait;
use dicom_core::Tag;
use dicom_object::DefaultDicomObject;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PushError {
    #[snafu(display("could not establish association with {destination}"))]
    Association {
        destination: String,
        source: Box<dicom_ul::association::Error>,
    },

    #[snafu(display("association failed while sending"))]
    Send {
        source: Box<dicom_ul::association::Error>,
    },

    #[snafu(display("could not stream data set"))]
    StreamData { source: std::io::Error },

    #[snafu(display("could not construct DICOM command"))]
    CreateCommand {
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("could not encode data set"))]
    WriteDataset {
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("unsupported transfer syntax {uid}"))]
    UnsupportedTransferSyntax { uid: String },

    #[snafu(display("archive accepted no presentation context for {sop_class_uid} in {transfer_syntax}"))]
    NoPresentationContext {
        sop_class_uid: String,
        transfer_syntax: String,
    },

    #[snafu(display("could not read C-STORE response"))]
    ReadResponse { source: dicom_object::ReadError },

    #[snafu(display("response has no {tag}"))]
    MissingAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },

    #[snafu(display("could not read {tag} of response"))]
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("unexpected response from archive: {pdu}"))]
    UnexpectedPdu { pdu: String },

    #[snafu(display("archive rejected instance {sop_instance_uid} (status code {status:04X}H)"))]
    Rejected { sop_instance_uid: String, status: u16 },

    #[snafu(display("archive cancelled the store of instance {sop_instance_uid}"))]
    Cancelled { sop_instance_uid: String },

    #[snafu(display("{message}"))]
    Archive { message: String },
}

impl PushError {
    /// The whole cause chain, for display to the user.
    pub fn message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// Submits objects to a remote archive.
///
/// One call is one all-or-nothing operation from the caller's point of view:
/// either every object of `batch` was accepted or an error is returned.
#[async_trait]
pub trait ArchivePush: Send + Sync {
    async fn push(&self, destination: &str, batch: &[DefaultDicomObject]) -> Result<(), PushError>;
}
