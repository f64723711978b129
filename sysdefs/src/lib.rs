pub mod tpm2;
