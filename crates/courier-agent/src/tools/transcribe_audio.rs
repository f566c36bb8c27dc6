//! Paid speech-to-text: fetch the audio bytes (cache first, Files API
//! fallback), run them through the transcription service, bill per minute
//! of reported duration.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use courier_cache::file_bytes;
use courier_core::pricing::transcription_cost;
use courier_store::repo::files;

use super::{ToolContext, ToolDescriptor, ToolExecutor, ToolOutcome};

static DESCRIPTOR: ToolDescriptor = ToolDescriptor {
    name: "transcribe_audio",
    emoji: "🎤",
    description: "Transcribe speech from an audio or video file in this conversation. \
                  Provide the file_id; optionally a language code for better accuracy.",
    paid: true,
    allowed_mime_prefixes: &["audio/", "video/"],
};

pub struct TranscribeAudio;

#[async_trait]
impl ToolExecutor for TranscribeAudio {
    fn descriptor(&self) -> &'static ToolDescriptor {
        &DESCRIPTOR
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Provider file id of the audio or video to transcribe"
                },
                "language": {
                    "type": "string",
                    "description": "ISO language code hint (e.g. \"ru\", \"en\"); omit for auto-detection"
                }
            },
            "required": ["file_id"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(file_id) = input["file_id"].as_str().map(String::from) else {
            return ToolOutcome::error("missing required parameter: file_id");
        };
        let language = input["language"].as_str().filter(|l| *l != "auto");

        let Some(transcription) = ctx.transcription.as_ref() else {
            return ToolOutcome::error("transcription is not configured on this bot");
        };

        // Sequential DB resolution before any parallel I/O.
        let lookup = {
            let file_id = file_id.clone();
            ctx.db
                .with_conn(move |conn| files::get(conn, &file_id))
                .await
        };
        let record = match lookup {
            Ok(Some(record)) => record,
            Ok(None) => {
                return ToolOutcome::error(format!("no file with id {file_id} in this thread"))
            }
            Err(e) => return ToolOutcome::error(format!("file lookup failed: {e}")),
        };

        if let Err(validation) = DESCRIPTOR.validate_mime(&record.mime) {
            return ToolOutcome::validation(&validation);
        }

        let bytes = match file_bytes::get_file_bytes(&ctx.cache, &record.chat_file_id).await {
            Some(bytes) => bytes,
            None => match ctx.files.download(&file_id).await {
                Ok(bytes) => {
                    file_bytes::store_file_bytes(&ctx.cache, &record.chat_file_id, &bytes).await;
                    bytes
                }
                Err(e) => return ToolOutcome::error(format!("audio download failed: {e}")),
            },
        };

        let filename = record.metadata["filename"]
            .as_str()
            .unwrap_or("audio.ogg")
            .to_string();
        debug!(file_id = %file_id, size = bytes.len(), "transcribing audio");

        match transcription
            .transcribe(bytes, &filename, &record.mime, language)
            .await
        {
            Ok(transcript) => {
                let cost = transcription_cost(transcript.duration);
                let payload = json!({
                    "transcript": transcript.text,
                    "language": transcript.language,
                    "duration_seconds": transcript.duration,
                })
                .to_string();
                ToolOutcome::success_with_cost(payload, cost)
            }
            Err(e) => ToolOutcome::error(format!("transcription failed: {e}")),
        }
    }
}
