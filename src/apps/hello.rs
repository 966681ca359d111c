use crate::loader::{AppModule, AppResponse, RouteBinding};
use crate::manifest::AppDescriptor;
use serde_json::json;

/// Minimal embedded app: a greeting and an echo of its own settings.
///
/// `settings.greeting` overrides the default greeting word.
pub struct HelloModule;

impl AppModule for HelloModule {
    fn routes(&self, app: &AppDescriptor) -> anyhow::Result<Vec<RouteBinding>> {
        let greeting = app
            .settings
            .get("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or("Hello")
            .to_string();
        let named_greeting = greeting.clone();

        Ok(vec![
            RouteBinding::get("/", move |req| {
                AppResponse::ok(json!({
                    "message": format!("{} from {}", greeting, req.app.name),
                    "version": req.app.version,
                }))
            }),
            RouteBinding::get("/greet/{name}", move |req| {
                let name = req.param("name").unwrap_or("world");
                AppResponse::ok(json!({ "message": format!("{}, {}!", named_greeting, name) }))
            }),
            RouteBinding::get("/settings", |req| {
                AppResponse::ok(serde_json::Value::Object(req.app.settings.clone()))
            }),
        ])
    }
}
