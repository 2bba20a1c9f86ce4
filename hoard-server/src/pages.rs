use std::fs;
use std::io;

const DEFAULT_ERROR_PAGE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>Not Found</title></head>\n\
<body>\n\
<h1>Not Found</h1>\n\
<p>The requested path <code>{{path}}</code> is not available.</p>\n\
<p><small>{{error}}</small></p>\n\
</body>\n\
</html>\n";

/// HTML pages served by the worker: the error page (optionally templated from
/// a file) and the generated target index.
pub struct Pages {
    error_template: String,
}

impl Pages {
    /// Loads the error template from `template_path`, falling back to the
    /// built-in page when none is configured.
    pub fn load(template_path: Option<&str>) -> io::Result<Self> {
        let error_template = match template_path {
            Some(path) => fs::read_to_string(path)?,
            None => DEFAULT_ERROR_PAGE.to_string(),
        };
        Ok(Pages { error_template })
    }

    /// Renders the error page; `{{path}}` and `{{error}}` are substituted.
    pub fn error(&self, path: &str, error: &str) -> String {
        self.error_template
            .replace("{{path}}", &escape(path))
            .replace("{{error}}", &escape(error))
    }

    /// Renders the index listing the bound targets.
    pub fn index(&self, targets: &[String]) -> String {
        let mut entries = String::new();
        for target in targets {
            let name = escape(target);
            entries.push_str(&format!("<li><a href=\"/{name}/\">{name}</a></li>\n"));
        }
        format!(
            "<!DOCTYPE html>\n<html>\n<head><title>hoard</title></head>\n\
             <body>\n<h1>Cached mirrors</h1>\n<ul>\n{entries}</ul>\n</body>\n</html>\n"
        )
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
