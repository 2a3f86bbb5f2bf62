use std::io;

#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Git failed to execute.\n\nstdout:\n{0}\nstderr:\n{1}", output.stdout, output.stderr)]
    ExecError { command: String, output: GitOutput },

    #[error("Missing ref {reference}")]
    MissingRef { reference: String },

    #[error("The remote could not be reached:\n{0}\n{1}", output.stdout, output.stderr)]
    RemoteUnreachable { output: GitOutput },

    #[error("The push was rejected because the remote ref advanced:\n{0}\n{1}", output.stdout, output.stderr)]
    PushRejected { output: GitOutput },

    #[error("Failed to execute git command")]
    IoError(#[from] io::Error),
}
