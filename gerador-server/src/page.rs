use base64::{prelude::BASE64_STANDARD, Engine};
use gerador_core::{GeneratedImage, GenerationError, PNG_FILE_NAME, PNG_MIME_TYPE};
use minijinja::{context, Environment, Value};

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");

/// What the UI shows below the prompt form.
#[derive(Debug)]
pub enum PageView {
    Idle,
    Warning { prompt: String, message: String },
    Generated { prompt: String, image: GeneratedImage },
    Failed { prompt: String, message: String },
}

impl PageView {
    pub fn from_outcome(prompt: String, outcome: Result<GeneratedImage, GenerationError>) -> Self {
        match outcome {
            Ok(image) => Self::Generated { prompt, image },
            Err(err @ (GenerationError::EmptyPrompt | GenerationError::InvalidRequest(_))) => {
                Self::Warning {
                    prompt,
                    message: err.to_string(),
                }
            }
            Err(err @ GenerationError::Inference(_)) => Self::Failed {
                prompt,
                message: err.to_string(),
            },
        }
    }

    fn context(&self) -> Value {
        let (prompt, warning, error, image) = match self {
            Self::Idle => ("", None, None, None),
            Self::Warning { prompt, message } => (prompt.as_str(), Some(message), None, None),
            Self::Failed { prompt, message } => (prompt.as_str(), None, Some(message), None),
            Self::Generated { prompt, image } => (
                prompt.as_str(),
                None,
                None,
                Some(context! {
                    data_uri => png_data_uri(&image.png),
                    width => image.width,
                    height => image.height,
                }),
            ),
        };
        context! {
            prompt,
            warning,
            error,
            image,
            file_name => PNG_FILE_NAME,
            mime_type => PNG_MIME_TYPE,
        }
    }
}

pub fn png_data_uri(png: &[u8]) -> String {
    format!("data:{PNG_MIME_TYPE};base64,{}", BASE64_STANDARD.encode(png))
}

/// The single HTML page of the UI.
pub struct Page {
    env: Environment<'static>,
}

impl Page {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template("index.html", INDEX_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, view: &PageView) -> Result<String, minijinja::Error> {
        self.env.get_template("index.html")?.render(view.context())
    }
}
