use crate::client::{ClientError, ProviderReply};
use crate::model::{AttemptOutcome, RejectReason};

/// Map one provider round trip to its terminal outcome.
pub fn classify(result: Result<ProviderReply, ClientError>) -> AttemptOutcome {
    match result {
        Ok(ProviderReply::Confirmed { reference }) => AttemptOutcome::Success { reference },
        Ok(ProviderReply::Declined { message }) => AttemptOutcome::Rejected(reject_reason(message)),
        Err(ClientError::DurationExceeded(message)) => {
            AttemptOutcome::Rejected(RejectReason::DurationExceeded(message))
        }
        Err(ClientError::Transport(e)) | Err(ClientError::Parse(e)) => AttemptOutcome::TransientFailure(e),
        Err(ClientError::Session(e)) => AttemptOutcome::TransientFailure(format!("session: {e}")),
    }
}

/// Sort a provider decline message into a reason.
pub fn reject_reason(message: String) -> RejectReason {
    let lower = message.to_lowercase();
    if lower.contains("restricted to") && lower.contains("minute") {
        RejectReason::DurationExceeded(message)
    } else if ["already", "taken", "not available", "unavailable"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        RejectReason::SlotTaken(message)
    } else {
        RejectReason::Declined(message)
    }
}
