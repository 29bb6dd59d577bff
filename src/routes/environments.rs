use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use super::not_found;
use crate::environment::EnvironmentDescriptor;
use crate::session::SessionController;

#[derive(Serialize)]
struct EnvironmentSummary<'a> {
    id: &'a str,
    display_name: &'a str,
    file_name: &'a str,
    samples: Vec<SampleSummary<'a>>,
}

#[derive(Serialize)]
struct SampleSummary<'a> {
    name: &'a str,
    file_name: &'a str,
}

impl<'a> From<&'a EnvironmentDescriptor> for EnvironmentSummary<'a> {
    fn from(d: &'a EnvironmentDescriptor) -> Self {
        Self {
            id: &d.id,
            display_name: &d.display_name,
            file_name: &d.file_name,
            samples: d
                .samples
                .iter()
                .map(|s| SampleSummary {
                    name: &s.name,
                    file_name: &s.file_name,
                })
                .collect(),
        }
    }
}

#[get("/environments")]
pub async fn get_environments_handler(controller: web::Data<SessionController>) -> impl Responder {
    let environments: Vec<EnvironmentSummary> = controller
        .registry()
        .iter()
        .map(EnvironmentSummary::from)
        .collect();
    HttpResponse::Ok().json(environments)
}

/// Full descriptor, sample contents included
#[get("/environments/{id}")]
pub async fn get_environment_handler(
    controller: web::Data<SessionController>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let id = path.into_inner().0;
    match controller.registry().lookup(&id) {
        Some(descriptor) => HttpResponse::Ok().json(descriptor),
        None => not_found(format!("Environment {id} not found.")),
    }
}
