use actix_web::{HttpResponse, Responder, post, web};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use super::{invalid_argument, session_error_response};
use crate::create_timestamp;
use crate::session::{
    CollectingSink, ExecutionRequest, SessionController, SessionStatus, StatusReport,
};

#[derive(Serialize, Deserialize, Debug)]
pub struct RunRequest {
    pub environment: String,
    pub code: String,
    /// Program input, base64 encoded
    #[serde(default)]
    pub input: Option<String>,
}

impl RunRequest {
    pub fn into_execution_request(self) -> Result<ExecutionRequest, base64::DecodeError> {
        let input = self.input.map(|s| BASE64.decode(s)).transpose()?;
        Ok(ExecutionRequest {
            environment_id: self.environment,
            source_code: self.code,
            input,
        })
    }
}

#[derive(Serialize, Debug)]
pub struct RunResponse {
    pub session: Option<String>,
    pub status: StatusReport,
    /// Combined stdout and stderr in delivery order
    pub output: String,
    pub created_time: String,
    pub finished_time: String,
}

/// Runs the program to completion and answers with its whole output
#[post("/run")]
pub async fn post_run_handler(
    controller: web::Data<SessionController>,
    body: web::Json<RunRequest>,
) -> impl Responder {
    let request = match body.into_inner().into_execution_request() {
        Ok(request) => request,
        Err(e) => return invalid_argument(format!("Invalid base64 input: {e}")),
    };

    let created_time = create_timestamp();
    let mut sink = CollectingSink::new();
    let status = controller.run_session(request, &mut sink).await;

    if let SessionStatus::Failed(e) = &status {
        return session_error_response(e);
    }

    HttpResponse::Ok().json(RunResponse {
        session: sink.session_id.take(),
        status: StatusReport::from(&status),
        output: String::from_utf8_lossy(&sink.combined()).into_owned(),
        created_time,
        finished_time: create_timestamp(),
    })
}
